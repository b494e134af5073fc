//! Application lifecycle adapter
//!
//! Samples the process table with `ps` and reports launches and quits as
//! the difference between consecutive snapshots. The first sample after
//! setup only establishes the baseline.
//!
//! On macOS only processes running from an `.app` bundle count, named after
//! the bundle. Elsewhere every executable name counts.

use snoopy_core::collector::{Poll, PollRequest, PollSource, RawRecord};
use snoopy_core::{now_epoch, Error, Result, WatermarkKind};
use std::collections::BTreeSet;
use std::io;
use std::process::Command;

pub const NAME: &str = "apps";

/// Default poll interval in seconds
pub const INTERVAL_SECS: f64 = 10.0;

/// Helpers and agents that come and go on their own
pub const BUILTIN_EXCLUDED: &[&str] = &[
    "Safari",
    "Music",
    "TV",
    "News",
    "Stocks",
    "Weather",
    "Phone",
    "Clock",
    "CoreServicesUIAgent",
    "CoreLocationAgent",
    "Cisco/Cisco Secure Client - Socket Filter",
    "Utilities/Nudge",
    "liquiddetectiond",
    "ManagedClient",
    "XProtect",
    "EscrowSecurityAlert",
    "TimeMachine/TMHelperAgent",
    "Setup Assistant",
    "Keychain Circle Notification",
];

/// Directories whose `<Name>.app/` children are applications
const BUNDLE_ROOTS: &[&str] = &["/Applications/", "/CoreServices/"];

type ProcessLister = Box<dyn FnMut() -> Result<Vec<String>> + Send>;

pub struct AppLifecycle {
    list_processes: ProcessLister,
    bundles_only: bool,
    previous: Option<BTreeSet<String>>,
}

impl AppLifecycle {
    /// Sample the real process table.
    pub fn from_ps() -> Self {
        Self::with_lister(Box::new(list_processes), cfg!(target_os = "macos"))
    }

    pub fn with_lister(list_processes: ProcessLister, bundles_only: bool) -> Self {
        Self {
            list_processes,
            bundles_only,
            previous: None,
        }
    }

    fn running_apps(&mut self) -> Result<BTreeSet<String>> {
        let lines = (self.list_processes)()?;
        Ok(lines
            .iter()
            .filter_map(|line| app_name(line.trim(), self.bundles_only))
            .collect())
    }
}

impl PollSource for AppLifecycle {
    fn setup(&mut self) -> Result<()> {
        self.previous = None;
        Ok(())
    }

    fn watermark_kind(&self) -> Option<WatermarkKind> {
        None
    }

    fn poll(&mut self, _request: &PollRequest) -> Result<Poll> {
        let current = self.running_apps()?;
        let now = now_epoch();

        let Some(previous) = self.previous.replace(current.clone()) else {
            tracing::info!(collector = NAME, apps = current.len(), "Baseline process snapshot");
            return Ok(Poll::default());
        };

        let launched = current.difference(&previous).map(|app| ("launch", app));
        let quit = previous.difference(&current).map(|app| ("quit", app));
        let records = launched
            .chain(quit)
            .map(|(event_type, app)| {
                RawRecord::new("app_events", now)
                    .field("event_type", event_type)
                    .field("app_name", app.as_str())
                    .field("bundle_id", "")
                    .subject(app.as_str())
            })
            .collect();

        Ok(Poll::records(records))
    }

    fn teardown(&mut self) {
        self.previous = None;
    }
}

fn list_processes() -> Result<Vec<String>> {
    let output = Command::new("ps")
        .args(["-eo", "comm="])
        .output()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::unavailable(NAME, "ps is not installed"),
            _ => Error::Io(e),
        })?;

    if !output.status.success() {
        return Err(Error::unavailable(
            NAME,
            format!("ps exited with {}", output.status),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

/// Application name for one `ps` command column.
fn app_name(command: &str, bundles_only: bool) -> Option<String> {
    if command.is_empty() {
        return None;
    }

    for root in BUNDLE_ROOTS {
        if let Some(start) = command.find(root) {
            let rest = &command[start + root.len()..];
            if let Some(end) = rest.find(".app/") {
                if end > 0 {
                    return Some(rest[..end].to_string());
                }
            }
        }
    }

    if bundles_only {
        return None;
    }
    command
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snoopy_core::Value;
    use std::sync::{Arc, Mutex};

    fn scripted(snapshots: Vec<Vec<&'static str>>, bundles_only: bool) -> AppLifecycle {
        let snapshots = Arc::new(Mutex::new(snapshots.into_iter()));
        AppLifecycle::with_lister(
            Box::new(move || {
                let next = snapshots.lock().unwrap().next().unwrap_or_default();
                Ok(next.into_iter().map(str::to_string).collect())
            }),
            bundles_only,
        )
    }

    fn transitions(poll: &Poll) -> Vec<(String, String)> {
        poll.records
            .iter()
            .map(|r| {
                let text = |i: usize| match &r.fields[i].1 {
                    Value::Text(s) => s.clone(),
                    other => panic!("unexpected value {:?}", other),
                };
                (text(0), text(1))
            })
            .collect()
    }

    #[test]
    fn test_app_name_from_bundle_paths() {
        assert_eq!(
            app_name("/Applications/Zed.app/Contents/MacOS/zed", true),
            Some("Zed".to_string())
        );
        assert_eq!(
            app_name("/System/Applications/Mail.app/Contents/MacOS/Mail", true),
            Some("Mail".to_string())
        );
        assert_eq!(
            app_name(
                "/System/Library/CoreServices/Finder.app/Contents/MacOS/Finder",
                true
            ),
            Some("Finder".to_string())
        );
        assert_eq!(
            app_name("/Applications/Utilities/Nudge.app/Contents/MacOS/Nudge", true),
            Some("Utilities/Nudge".to_string())
        );
        assert_eq!(app_name("/usr/sbin/cfprefsd", true), None);
        assert_eq!(app_name("/usr/bin/vim", false), Some("vim".to_string()));
        assert_eq!(app_name("bash", false), Some("bash".to_string()));
        assert_eq!(app_name("", false), None);
    }

    #[test]
    fn test_first_poll_is_baseline_then_diffs() {
        let mut source = scripted(
            vec![
                vec!["firefox", "bash"],
                vec!["firefox", "bash", "vim"],
                vec!["bash"],
            ],
            false,
        );

        let poll = source.poll(&PollRequest::Snapshot).unwrap();
        assert!(poll.records.is_empty());

        let poll = source.poll(&PollRequest::Snapshot).unwrap();
        assert_eq!(
            transitions(&poll),
            vec![("launch".to_string(), "vim".to_string())]
        );

        let poll = source.poll(&PollRequest::Snapshot).unwrap();
        assert_eq!(
            transitions(&poll),
            vec![
                ("quit".to_string(), "firefox".to_string()),
                ("quit".to_string(), "vim".to_string()),
            ]
        );
        assert_eq!(poll.records[0].subjects, vec!["firefox"]);
    }

    #[test]
    fn test_setup_resets_baseline() {
        let mut source = scripted(vec![vec!["bash"], vec!["bash", "vim"]], false);

        source.poll(&PollRequest::Snapshot).unwrap();
        source.setup().unwrap();
        let poll = source.poll(&PollRequest::Snapshot).unwrap();
        assert!(poll.records.is_empty());
    }

    #[test]
    fn test_lister_error_propagates() {
        let mut source = AppLifecycle::with_lister(
            Box::new(|| Err(Error::unavailable(NAME, "ps is not installed"))),
            false,
        );
        let err = source.poll(&PollRequest::Snapshot).unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }
}
