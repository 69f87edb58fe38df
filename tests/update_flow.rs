//! End-to-end self-update pipeline against fake release metadata.

mod support;

use semver::Version;
use sha2::{Digest, Sha256};

use mediagrab::Error;
use mediagrab::events::{AppEvent, EventBus, UpdateEvent};
use mediagrab::updater::{UpdateOrchestrator, UpdaterConfig};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn orchestrator(
    releases: Vec<mediagrab::github::Release>,
    installer_asset: &str,
    events: EventBus,
) -> UpdateOrchestrator<support::FakeReleases> {
    UpdateOrchestrator::new(
        UpdaterConfig {
            repo_owner: "mediagrab".to_string(),
            repo_name: "mediagrab".to_string(),
            current_version: Version::new(1, 0, 0),
            build_sha: None,
            installer_asset: installer_asset.to_string(),
            user_agent: "mediagrab-tests".to_string(),
        },
        support::FakeReleases { releases },
        events,
    )
    .expect("orchestrator builds")
}

#[tokio::test]
async fn a_tampered_installer_is_rejected_and_never_launched() {
    let body = b"installer payload served by the registry".to_vec();
    let url = support::serve_bytes(body.clone()).await;

    // The digest commits to different bytes than the server returns
    let digest = format!("sha256:{}", sha256_hex(b"what the release was signed for"));
    let installer_name = "flow-tampered-setup.exe";

    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let updater = orchestrator(
        vec![support::release(
            "v2.0.0",
            vec![support::asset(
                installer_name,
                &url,
                body.len() as u64,
                Some(digest),
            )],
        )],
        installer_name,
        events,
    );

    assert!(updater.check_for_updates(true).await.expect("check runs"));

    let err = updater
        .start_update()
        .await
        .expect_err("hash mismatch must fail the update");
    assert!(matches!(err, Error::Integrity { .. }));

    // The rejected download is gone and the installer was never spawned
    assert!(!updater.installer_temp_path().exists());

    // The pipeline reported its steps before failing the gate
    let mut saw_step = false;
    while let Ok(event) = receiver.try_recv() {
        if let AppEvent::Update(UpdateEvent::Step { message }) = event {
            assert!(message.contains("Downloading installer"));
            saw_step = true;
        }
    }
    assert!(saw_step);
}

#[tokio::test]
async fn a_genuine_installer_passes_the_gate_up_to_launch() {
    let body = b"genuine installer bytes".to_vec();
    let url = support::serve_bytes(body.clone()).await;
    let installer_name = "flow-genuine-setup.exe";

    // Sidecar checksum asset matching the payload
    let sidecar_text = format!("{}  {installer_name}\n", sha256_hex(&body));
    let sidecar_url = support::serve_bytes(sidecar_text.into_bytes()).await;

    let updater = orchestrator(
        vec![support::release(
            "v2.0.0",
            vec![
                support::asset(installer_name, &url, body.len() as u64, None),
                support::asset(&format!("{installer_name}.sha256"), &sidecar_url, 0, None),
            ],
        )],
        installer_name,
        EventBus::default(),
    );

    assert!(updater.check_for_updates(false).await.expect("check runs"));

    // The verification gate passes; the final spawn of the (non-executable)
    // payload is the only thing that can fail, and that failure proves the
    // pipeline got past the gate
    match updater.start_update().await {
        Ok(()) => {}
        Err(Error::Process { context, .. }) => {
            assert!(context.contains("installer"));
        }
        Err(other) => panic!("unexpected failure before the spawn step: {other}"),
    }
}
