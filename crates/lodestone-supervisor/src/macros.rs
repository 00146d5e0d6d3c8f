//! Macro scripts, running tasks, and run history.
//!
//! A macro is a plain-text file `<instance>/macros/<name>.macro`. Each
//! non-empty line that does not start with `#` is a console command, except
//! `wait <duration>` which pauses the run. `$1`..`$9` expand to positional
//! arguments and `$@` to all of them joined by spaces.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use lodestone_core::config::parse_duration;
use lodestone_core::{
    Error, ExitStatus, HistoryEntry, MacroEntry, MacroPid, Result, TaskEntry, epoch_secs,
};
use lodestone_events::ProgressionHandle;
use tokio::sync::oneshot;

const MACRO_DIR: &str = "macros";
const MACRO_EXT: &str = "macro";

// ── Store ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct MacroStore {
    dir: PathBuf,
}

impl MacroStore {
    pub fn new(instance_path: &Path) -> Self {
        Self {
            dir: instance_path.join(MACRO_DIR),
        }
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{MACRO_EXT}")))
    }

    pub async fn list(&self) -> Result<Vec<MacroEntry>> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MACRO_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let last_modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs());
            entries.push(MacroEntry {
                name: name.to_string(),
                last_modified,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn create(&self, name: &str, content: &str) -> Result<()> {
        let path = self.path_of(name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        if tokio::fs::try_exists(&path).await? {
            return Err(Error::conflict(format!("macro {name:?} already exists")));
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_of(name)?;
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("macro {name:?} not found")),
            _ => e.into(),
        })
    }

    pub async fn read(&self, name: &str) -> Result<String> {
        let path = self.path_of(name)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::not_found(format!("macro {name:?} not found"))
                }
                _ => e.into(),
            })
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_input(format!(
            "invalid macro name {name:?}: use 1-64 letters, digits, '-' or '_'"
        )))
    }
}

// ── Script ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Command(String),
    Wait(Duration),
}

/// Expand a macro into steps. Fails before anything runs.
pub(crate) fn parse_script(content: &str, args: &[String]) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = substitute(line, args)?;
        if let Some(rest) = line.strip_prefix("wait ") {
            let duration = parse_duration(rest).ok_or_else(|| {
                Error::invalid_input(format!(
                    "line {}: cannot parse wait duration {:?}",
                    index + 1,
                    rest.trim()
                ))
            })?;
            steps.push(Step::Wait(duration));
        } else {
            steps.push(Step::Command(line));
        }
    }
    Ok(steps)
}

fn substitute(line: &str, args: &[String]) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('@') => {
                chars.next();
                out.push_str(&args.join(" "));
            }
            Some(d @ '1'..='9') => {
                chars.next();
                let n = d as usize - '0' as usize;
                let arg = args.get(n - 1).ok_or_else(|| {
                    Error::invalid_input(format!(
                        "macro expects argument ${n} but only {} given",
                        args.len()
                    ))
                })?;
                out.push_str(arg);
            }
            _ => out.push('$'),
        }
    }
    Ok(out)
}

// ── Tasks ─────────────────────────────────────────────────────────

struct RunningTask {
    entry: TaskEntry,
    kill: Option<oneshot::Sender<()>>,
    progression: ProgressionHandle,
}

struct Tables {
    running: IndexMap<MacroPid, RunningTask>,
    history: VecDeque<HistoryEntry>,
}

/// Running tasks and finished history of one instance.
///
/// A task moves from `running` to `history` under a single lock, so no
/// reader ever sees it in both or in neither. Its progression `End` is
/// emitted under the same lock, before the move.
pub(crate) struct TaskTable {
    tables: Mutex<Tables>,
    history_limit: usize,
}

impl TaskTable {
    pub fn new(history_limit: usize) -> Self {
        Self {
            tables: Mutex::new(Tables {
                running: IndexMap::new(),
                history: VecDeque::new(),
            }),
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task; the returned receiver fires when it is killed.
    pub fn insert(&self, entry: TaskEntry, progression: ProgressionHandle) -> oneshot::Receiver<()> {
        let (kill, killed) = oneshot::channel();
        self.lock().running.insert(
            entry.pid,
            RunningTask {
                entry,
                kill: Some(kill),
                progression,
            },
        );
        killed
    }

    /// Move a task to history. Returns the status actually recorded, which
    /// is `Killed` if [`TaskTable::kill`] got there first.
    pub fn finish(&self, pid: MacroPid, exit_status: ExitStatus) -> ExitStatus {
        let mut tables = self.lock();
        match tables.running.shift_remove(&pid) {
            Some(task) => {
                Self::retire(&mut tables, self.history_limit, task, exit_status.clone());
                exit_status
            }
            None => tables
                .history
                .iter()
                .rev()
                .find(|h| h.task.pid == pid)
                .map(|h| h.exit_status.clone())
                .unwrap_or(ExitStatus::Killed { time: epoch_secs() }),
        }
    }

    pub fn kill(&self, pid: MacroPid) -> Result<()> {
        let mut tables = self.lock();
        let mut task = tables
            .running
            .shift_remove(&pid)
            .ok_or_else(|| Error::not_found(format!("no running macro task {pid}")))?;
        if let Some(kill) = task.kill.take() {
            let _ = kill.send(());
        }
        Self::retire(
            &mut tables,
            self.history_limit,
            task,
            ExitStatus::Killed { time: epoch_secs() },
        );
        Ok(())
    }

    pub fn kill_all(&self) -> usize {
        let pids: Vec<MacroPid> = self.lock().running.keys().copied().collect();
        pids.into_iter().filter(|pid| self.kill(*pid).is_ok()).count()
    }

    pub fn tasks(&self) -> Vec<TaskEntry> {
        self.lock()
            .running
            .values()
            .map(|t| t.entry.clone())
            .collect()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }

    fn retire(tables: &mut Tables, limit: usize, task: RunningTask, exit_status: ExitStatus) {
        let RunningTask {
            entry, progression, ..
        } = task;
        let message = match &exit_status {
            ExitStatus::Success { .. } => format!("Macro {} finished", entry.name),
            ExitStatus::Killed { .. } => format!("Macro {} was killed", entry.name),
            ExitStatus::Error { error_msg, .. } => error_msg.clone(),
        };
        progression.end(exit_status.is_success(), Some(message));
        tables.history.push_back(HistoryEntry {
            task: entry,
            exit_status,
        });
        while tables.history.len() > limit {
            tables.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lodestone_core::{CausedBy, ErrorKind};
    use lodestone_events::{EventBroadcaster, ProgressionEventInner};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn entry(pid: u32) -> TaskEntry {
        TaskEntry {
            pid: MacroPid(pid),
            name: "deploy".to_string(),
            args: args(&["--fast"]),
            caused_by: CausedBy::System,
            event_id: format!("ev-{pid}"),
            creation_time: 0,
        }
    }

    #[test]
    fn parses_commands_waits_and_comments() {
        let script = "# warm up\nsay hello $1\n\nwait 250ms\nbroadcast $@\n";
        let steps = parse_script(script, &args(&["world", "now"])).unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Command("say hello world".to_string()),
                Step::Wait(Duration::from_millis(250)),
                Step::Command("broadcast world now".to_string()),
            ]
        );
    }

    #[test]
    fn missing_argument_is_invalid_input() {
        let err = parse_script("kick $2", &args(&["steve"])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn bad_wait_is_invalid_input() {
        assert!(parse_script("wait later", &[]).is_err());
    }

    #[test]
    fn overflowing_wait_is_invalid_input() {
        for script in ["wait 307445734561825861m", "wait 5124095576030432h"] {
            let err = parse_script(script, &[]).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput, "{script}");
        }
    }

    #[test]
    fn lone_dollar_is_literal() {
        let steps = parse_script("say costs $0 or $", &[]).unwrap();
        assert_eq!(steps, vec![Step::Command("say costs $0 or $".to_string())]);
    }

    #[test]
    fn names_are_restricted() {
        assert!(validate_name("deploy-2_fast").is_ok());
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("").is_err());
    }

    fn progression(events: &Arc<EventBroadcaster>) -> ProgressionHandle {
        events.progression_start("Running macro deploy", Some(1.0), CausedBy::System)
    }

    #[test]
    fn finished_task_moves_to_history() {
        let events = Arc::new(EventBroadcaster::new(16));
        let table = TaskTable::new(10);
        let _killed = table.insert(entry(1), progression(&events));
        assert_eq!(table.tasks().len(), 1);
        let status = table.finish(MacroPid(1), ExitStatus::Success { time: 1 });
        assert!(status.is_success());
        assert!(table.tasks().is_empty());
        assert_eq!(table.history().len(), 1);
        assert!(table.history()[0].success());
    }

    #[test]
    fn end_is_emitted_when_the_task_reaches_history() {
        let events = Arc::new(EventBroadcaster::new(16));
        let table = TaskTable::new(10);
        let _killed = table.insert(entry(1), progression(&events));
        let _killed = table.insert(entry(2), progression(&events));

        let ended = || {
            events
                .buffered(None)
                .iter()
                .filter_map(|e| e.progression())
                .filter(|p| matches!(p.progression_event_inner, ProgressionEventInner::End { .. }))
                .count()
        };
        assert_eq!(ended(), 0);
        table.finish(MacroPid(1), ExitStatus::Success { time: 1 });
        assert_eq!(ended(), 1);
        table.kill(MacroPid(2)).unwrap();
        assert_eq!(ended(), 2);
        assert_eq!(table.history().len(), 2);
    }

    #[test]
    fn kill_wins_over_late_finish() {
        let events = Arc::new(EventBroadcaster::new(16));
        let table = TaskTable::new(10);
        let mut killed = table.insert(entry(1), progression(&events));
        table.kill(MacroPid(1)).unwrap();
        assert!(killed.try_recv().is_ok());
        let status = table.finish(MacroPid(1), ExitStatus::Success { time: 2 });
        assert!(matches!(status, ExitStatus::Killed { .. }));
        assert_eq!(table.history().len(), 1);
        assert!(table.tasks().is_empty());
    }

    #[test]
    fn kill_unknown_pid_is_not_found() {
        let table = TaskTable::new(10);
        assert!(table.kill(MacroPid(9)).unwrap_err().is(ErrorKind::NotFound));
    }

    #[test]
    fn history_is_capped() {
        let events = Arc::new(EventBroadcaster::new(16));
        let table = TaskTable::new(2);
        for pid in 0..5 {
            let _ = table.insert(entry(pid), progression(&events));
            table.finish(MacroPid(pid), ExitStatus::Success { time: 0 });
        }
        let history = table.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].task.pid, MacroPid(3));
    }

    #[tokio::test]
    async fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MacroStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());
        store.create("deploy", "say hi").await.unwrap();
        assert!(store.create("deploy", "x").await.unwrap_err().is(ErrorKind::Conflict));
        assert_eq!(store.read("deploy").await.unwrap(), "say hi");
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["deploy"]);
        store.delete("deploy").await.unwrap();
        assert!(store.read("deploy").await.unwrap_err().is(ErrorKind::NotFound));
        assert!(store.delete("deploy").await.unwrap_err().is(ErrorKind::NotFound));
    }
}
