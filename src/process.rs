//! Process-tree discovery and termination.
//!
//! The media tool spawns helper processes (ffmpeg among them); cancelling a
//! download must take the whole subtree down, not just the root.

/// Resolves the descendants of a process. Injectable so tests can supply a
/// canned process table.
pub trait ProcessTree: Send + Sync {
    /// Pids of every process transitively spawned by `root`, excluding
    /// `root` itself, parents before their children.
    fn descendants(&self, root: u32) -> Vec<u32>;
}

/// Breadth-first walk of a `(pid, ppid)` table.
pub(crate) fn descendants_of(table: &[(u32, u32)], root: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut frontier = vec![root];

    while let Some(parent) = frontier.pop() {
        for &(pid, ppid) in table {
            if ppid == parent && pid != root && !found.contains(&pid) {
                found.push(pid);
                frontier.push(pid);
            }
        }
    }

    found
}

/// Queries the live process table through platform tooling.
pub struct SystemProcessTree;

impl ProcessTree for SystemProcessTree {
    #[cfg(unix)]
    fn descendants(&self, root: u32) -> Vec<u32> {
        let output = match std::process::Command::new("ps")
            .args(["-Ao", "pid=,ppid="])
            .output()
        {
            Ok(output) => output,
            Err(err) => {
                log::warn!("failed to read process table: {err}");
                return Vec::new();
            }
        };

        let table: Vec<(u32, u32)> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let pid = fields.next()?.parse().ok()?;
                let ppid = fields.next()?.parse().ok()?;
                Some((pid, ppid))
            })
            .collect();

        descendants_of(&table, root)
    }

    #[cfg(windows)]
    fn descendants(&self, _root: u32) -> Vec<u32> {
        // taskkill /T walks the tree itself
        Vec::new()
    }
}

/// Terminates `root` and everything it spawned, children before parents.
pub fn kill_tree(root: u32, tree: &dyn ProcessTree) {
    #[cfg(windows)]
    {
        let _ = tree;
        match std::process::Command::new("taskkill")
            .args(["/PID", &root.to_string(), "/T", "/F"])
            .output()
        {
            Ok(output) if !output.status.success() => {
                log::warn!(
                    "taskkill for pid {root} exited with {:?}",
                    output.status.code()
                );
            }
            Ok(_) => {}
            Err(err) => log::warn!("failed to run taskkill for pid {root}: {err}"),
        }
    }

    #[cfg(unix)]
    {
        let mut order = tree.descendants(root);
        order.reverse();
        order.push(root);

        log::debug!("killing process tree rooted at {root}: {order:?}");

        let mut command = std::process::Command::new("kill");
        command.arg("-9");
        for pid in &order {
            command.arg(pid.to_string());
        }

        match command.output() {
            // Some pids may already be gone; that is fine
            Ok(_) => {}
            Err(err) => log::warn!("failed to kill process tree rooted at {root}: {err}"),
        }
    }
}
