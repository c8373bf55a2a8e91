use std::collections::HashSet;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessesToUpdate, System};
use users::os::unix::UserExt;
use users::{Users, UsersCache};

/// Deepest parent chain walked before giving up on an ancestry check.
const MAX_ANCESTRY_DEPTH: usize = 64;

/// Returns the CPU brand string of this machine, as the OS reports it.
pub fn cpu_brand_string() -> String {
    let mut system = System::new();
    system.refresh_cpu_all();
    system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Tag under which a run is logged: the explicit tag, or the base name of the
/// invoked binary.
pub fn resolve_tag(tag: Option<&str>, cmdline: &[String]) -> String {
    match tag {
        Some(tag) if !tag.is_empty() => tag.to_string(),
        _ => cmdline
            .first()
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

/// Home directory of the current user, from the passwd database.
pub fn resolve_home_dir() -> Option<PathBuf> {
    let users_cache = UsersCache::new();
    users_cache
        .get_user_by_uid(users_cache.get_current_uid())
        .map(|user| user.home_dir().to_path_buf())
}

/// Where a PID seen on a GPU stands relative to the tracked process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lineage {
    /// The root itself, or a process seen descending from it
    Tracked,
    /// A live process outside the tree
    Foreign,
    /// Gone before any refresh saw it, so its ancestry is unknowable
    Unknown,
}

/// View of the process tree rooted at one PID.
///
/// Every live descendant found by `refresh` is remembered, so a child that
/// exits between two refreshes is still attributed to the root.
pub struct ProcessTree {
    system: System,
    root: u32,
    descendants: HashSet<u32>,
}

impl ProcessTree {
    pub fn new(root: u32) -> Self {
        Self {
            system: System::new(),
            root,
            descendants: HashSet::new(),
        }
    }

    /// Rescans the process table and records every live descendant of the root.
    pub fn refresh(&mut self) {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let found: Vec<u32> = self
            .system
            .processes()
            .keys()
            .map(|pid| pid.as_u32())
            .filter(|pid| *pid != self.root && !self.descendants.contains(pid))
            .filter(|pid| self.descends_from_root(*pid))
            .collect();
        self.descendants.extend(found);
    }

    /// Classifies `pid` against the tree as of the last `refresh`.
    pub fn lineage(&self, pid: u32) -> Lineage {
        if pid == self.root || self.descendants.contains(&pid) {
            Lineage::Tracked
        } else if self.system.process(Pid::from_u32(pid)).is_some() {
            Lineage::Foreign
        } else {
            Lineage::Unknown
        }
    }

    fn descends_from_root(&self, pid: u32) -> bool {
        let mut current = Pid::from_u32(pid);
        for _ in 0..MAX_ANCESTRY_DEPTH {
            match self.system.process(current).and_then(|p| p.parent()) {
                Some(parent) if parent.as_u32() == self.root => return true,
                Some(parent) if self.descendants.contains(&parent.as_u32()) => return true,
                Some(parent) if parent == current => return false,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }
}
