//! In-memory mock filesystem for testing collectors without a real cgroup
//! hierarchy or `/proc`.
//!
//! `MockFs` stores files and directories in memory behind a mutex so the
//! quota writer can mutate it through a shared reference, and supports
//! injecting write failures to exercise the memory scale-down path of the
//! enforcer.

use crate::collector::traits::FileSystem;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Debug, Default)]
struct MockState {
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
    gids: HashMap<PathBuf, u32>,
    mtimes: HashMap<PathBuf, SystemTime>,
    /// Paths that reject the next N writes with EPERM-style errors.
    failing_writes: HashMap<PathBuf, u32>,
    /// Paths whose reads always fail with permission denied.
    denied_reads: HashSet<PathBuf>,
    /// Scripted read sequences: each read consumes one entry until only
    /// the last remains, which then repeats. Lets tests present advancing
    /// cumulative counters to consecutive sub-samples.
    scripted_reads: HashMap<PathBuf, std::collections::VecDeque<String>>,
}

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    state: Arc<Mutex<MockState>>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content. Parent directories are created.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state.lock().unwrap();
        add_parents(&mut state.directories, &path);
        state.files.insert(path, content.into());
    }

    /// Adds an empty directory, including parents.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut state = self.state.lock().unwrap();
        add_parents(&mut state.directories, &path);
        state.directories.insert(path);
    }

    /// Removes a file or directory tree, simulating a vanished cgroup.
    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut state = self.state.lock().unwrap();
        state.files.retain(|p, _| !p.starts_with(path));
        state.directories.retain(|p| !p.starts_with(path));
    }

    /// Sets the group owner of a path.
    pub fn set_group_owner(&self, path: impl AsRef<Path>, gid: u32) {
        let mut state = self.state.lock().unwrap();
        state.gids.insert(path.as_ref().to_path_buf(), gid);
    }

    /// Sets the modification time of a path.
    pub fn set_modified(&self, path: impl AsRef<Path>, mtime: SystemTime) {
        let mut state = self.state.lock().unwrap();
        state.mtimes.insert(path.as_ref().to_path_buf(), mtime);
    }

    /// Makes the next `count` writes to `path` fail.
    pub fn fail_next_writes(&self, path: impl AsRef<Path>, count: u32) {
        let mut state = self.state.lock().unwrap();
        state
            .failing_writes
            .insert(path.as_ref().to_path_buf(), count);
    }

    /// Makes every read of `path` fail with permission denied.
    pub fn deny_reads(&self, path: impl AsRef<Path>) {
        let mut state = self.state.lock().unwrap();
        state.denied_reads.insert(path.as_ref().to_path_buf());
    }

    /// Replaces the scripted read sequence for a path.
    pub fn script_reads(&self, path: impl AsRef<Path>, contents: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        state
            .scripted_reads
            .insert(path.as_ref().to_path_buf(), contents.into());
    }

    /// Returns the current content of a file, if present.
    pub fn content(&self, path: impl AsRef<Path>) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.files.get(path.as_ref()).cloned()
    }

    /// Builds a mock with `/proc` meta files for a small 4-thread machine
    /// with 2 hyperthreaded cores and 8 GiB of RAM.
    pub fn small_host() -> Self {
        let fs = Self::new();
        fs.add_file("/proc/sys/kernel/hostname", "node1\n");
        fs.add_file(
            "/proc/meminfo",
            "MemTotal:        8388608 kB\nMemFree:         4194304 kB\nSwapTotal:       2097152 kB\nSwapFree:        2097152 kB\n",
        );
        fs.add_file(
            "/proc/stat",
            "cpu  1000 0 1000 8000 0 0 0 0 0 0\ncpu0 250 0 250 2000 0 0 0 0 0 0\n",
        );
        let mut cpuinfo = String::new();
        for cpu in 0..4 {
            cpuinfo.push_str(&format!(
                "processor\t: {cpu}\nsiblings\t: 4\ncpu cores\t: 2\n\n"
            ));
        }
        fs.add_file("/proc/cpuinfo", cpuinfo);
        fs.add_file("/proc/uptime", "5000.00 15000.00\n");
        fs
    }

    /// Adds a `user-<uid>.slice` cgroup with the given cumulative counters.
    pub fn add_user_slice(&self, uid: u32, cputime_ns: u64, rss_bytes: u64, pids: &[i32]) {
        let systemd = format!("/sys/fs/cgroup/systemd/user.slice/user-{uid}.slice");
        let cpuacct = format!("/sys/fs/cgroup/cpuacct/user.slice/user-{uid}.slice");
        let cpu = format!("/sys/fs/cgroup/cpu/user.slice/user-{uid}.slice");
        let memory = format!("/sys/fs/cgroup/memory/user.slice/user-{uid}.slice");
        self.add_dir(&systemd);
        self.add_dir(&cpuacct);
        self.add_dir(&memory);
        let procs: String = pids.iter().map(|p| format!("{p}\n")).collect();
        self.add_file(format!("{systemd}/cgroup.procs"), procs);
        self.add_file(
            format!("{cpu}/cpuacct.usage_percpu"),
            format!("{} {} 0 0\n", cputime_ns / 2, cputime_ns - cputime_ns / 2),
        );
        self.add_file(format!("{cpuacct}/cpu.cfs_period_us"), "100000\n");
        self.add_file(format!("{cpuacct}/cpu.cfs_quota_us"), "-1\n");
        self.add_file(
            format!("{memory}/memory.stat"),
            format!("total_cache 0\ntotal_rss {rss_bytes}\ntotal_mapped_file 0\ntotal_swap 0\n"),
        );
        self.add_file(format!("{memory}/memory.limit_in_bytes"), "9223372036854771712\n");
        self.add_file(
            format!("{memory}/memory.memsw.limit_in_bytes"),
            "9223372036854771712\n",
        );
    }

    /// Updates the cumulative counters of an existing user slice.
    pub fn update_user_slice(&self, uid: u32, cputime_ns: u64, rss_bytes: u64) {
        let cpu = format!("/sys/fs/cgroup/cpu/user.slice/user-{uid}.slice");
        let memory = format!("/sys/fs/cgroup/memory/user.slice/user-{uid}.slice");
        self.add_file(
            format!("{cpu}/cpuacct.usage_percpu"),
            format!("{} {} 0 0\n", cputime_ns / 2, cputime_ns - cputime_ns / 2),
        );
        self.add_file(
            format!("{memory}/memory.stat"),
            format!("total_cache 0\ntotal_rss {rss_bytes}\ntotal_mapped_file 0\ntotal_swap 0\n"),
        );
    }

    /// Adds the aggregate `user.slice` cgroup.
    pub fn add_aggregate_slice(&self, cputime_ns: u64, rss_bytes: u64) {
        let systemd = "/sys/fs/cgroup/systemd/user.slice";
        let cpu = "/sys/fs/cgroup/cpu/user.slice";
        let memory = "/sys/fs/cgroup/memory/user.slice";
        self.add_dir(systemd);
        self.add_dir(memory);
        self.add_file(format!("{systemd}/cgroup.procs"), "");
        self.add_file(
            format!("{cpu}/cpuacct.usage_percpu"),
            format!("{} {} 0 0\n", cputime_ns / 2, cputime_ns - cputime_ns / 2),
        );
        self.add_file(
            format!("{memory}/memory.stat"),
            format!("total_cache 0\ntotal_rss {rss_bytes}\ntotal_mapped_file 0\ntotal_swap 0\n"),
        );
    }

    /// Adds a `/proc/<pid>` entry with the given owner and counters.
    pub fn add_process(
        &self,
        pid: i32,
        name: &str,
        owner_uid: u32,
        cputime_ticks: u64,
        rss_kb: u64,
    ) {
        let base = format!("/proc/{pid}");
        self.add_dir(&base);
        self.add_file(
            format!("{base}/status"),
            format!(
                "Name:\t{name}\nUid:\t{owner_uid}\t{owner_uid}\t{owner_uid}\t{owner_uid}\nVmRSS:\t{rss_kb} kB\nVmSwap:\t0 kB\n"
            ),
        );
        // Fields 14/15 are utime/stime, field 22 is starttime.
        let mut stat_fields = vec!["0".to_string(); 52];
        stat_fields[0] = pid.to_string();
        stat_fields[1] = format!("({name})");
        stat_fields[13] = cputime_ticks.to_string();
        stat_fields[14] = "0".to_string();
        stat_fields[21] = "100".to_string();
        self.add_file(format!("{base}/stat"), stat_fields.join(" ") + "\n");
    }

    /// Updates the cumulative cputime of an existing `/proc/<pid>` entry.
    pub fn update_process(&self, pid: i32, name: &str, owner_uid: u32, cputime_ticks: u64, rss_kb: u64) {
        self.add_process(pid, name, owner_uid, cputime_ticks, rss_kb);
    }

    /// Bumps the system-wide cputime counters in `/proc/stat`.
    pub fn set_total_clockticks(&self, ticks: u64) {
        self.add_file(
            "/proc/stat",
            format!("cpu  {ticks} 0 0 0 0 0 0 0 0 0\ncpu0 0 0 0 0 0 0 0 0 0 0\n"),
        );
    }
}

fn add_parents(directories: &mut HashSet<PathBuf>, path: &Path) {
    let mut parent = path.parent();
    while let Some(p) = parent {
        if !p.as_os_str().is_empty() {
            directories.insert(p.to_path_buf());
        }
        parent = p.parent();
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.denied_reads.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", path.display()),
            ));
        }
        if let Some(sequence) = state.scripted_reads.get_mut(path) {
            if sequence.len() > 1 {
                if let Some(next) = sequence.pop_front() {
                    return Ok(next);
                }
            } else if let Some(last) = sequence.front() {
                return Ok(last.clone());
            }
        }
        state.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )
        })
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.failing_writes.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("write rejected: {}", path.display()),
                ));
            }
        }
        let path = path.to_path_buf();
        add_parents(&mut state.directories, &path);
        state.files.insert(path, contents.to_string());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(path) || state.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let state = self.state.lock().unwrap();
        if !state.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such directory: {}", path.display()),
            ));
        }
        let mut entries: Vec<PathBuf> = state
            .files
            .keys()
            .chain(state.directories.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    fn group_owner(&self, path: &Path) -> io::Result<u32> {
        let state = self.state.lock().unwrap();
        state.gids.get(path).copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )
        })
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        let state = self.state.lock().unwrap();
        state.mtimes.get(path).copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let fs = MockFs::new();
        fs.add_file("/a/b", "hello");
        assert_eq!(fs.read_to_string(Path::new("/a/b")).unwrap(), "hello");
        fs.write(Path::new("/a/b"), "bye").unwrap();
        assert_eq!(fs.content("/a/b").unwrap(), "bye");
    }

    #[test]
    fn failing_writes_are_consumed() {
        let fs = MockFs::new();
        fs.add_file("/limit", "0");
        fs.fail_next_writes("/limit", 2);
        assert!(fs.write(Path::new("/limit"), "1").is_err());
        assert!(fs.write(Path::new("/limit"), "2").is_err());
        assert!(fs.write(Path::new("/limit"), "3").is_ok());
        assert_eq!(fs.content("/limit").unwrap(), "3");
    }

    #[test]
    fn read_dir_lists_children_only() {
        let fs = MockFs::new();
        fs.add_file("/sys/fs/cgroup/systemd/user.slice/user-1000.slice/cgroup.procs", "");
        fs.add_file("/sys/fs/cgroup/systemd/user.slice/user-1001.slice/cgroup.procs", "");
        let entries = fs
            .read_dir(Path::new("/sys/fs/cgroup/systemd/user.slice"))
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn remove_drops_subtree() {
        let fs = MockFs::new();
        fs.add_user_slice(1000, 1_000_000, 4096, &[42]);
        assert!(fs.exists(Path::new(
            "/sys/fs/cgroup/systemd/user.slice/user-1000.slice"
        )));
        fs.remove("/sys/fs/cgroup/systemd/user.slice/user-1000.slice");
        assert!(!fs.exists(Path::new(
            "/sys/fs/cgroup/systemd/user.slice/user-1000.slice"
        )));
    }
}
