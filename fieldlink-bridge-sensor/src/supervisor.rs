//! Sensor worker and link supervision.
//!
//! The worker reads lines from the sensor terminal, feeds the assembler and
//! offers completed blocks to the snapshot store. When the link fails it
//! closes the session, drops any partial block and tries to reattach a
//! bounded number of times before asking the whole bridge to stop.

use std::collections::HashSet;
use std::time::Duration;

use fieldlink_bridge_framework::{LinkStatus, Shutdown, ShutdownListener};
use serde_json::json;
use tokio::io::WriteHalf;
use tokio::time::Instant;
use tokio_serial::SerialStream;

use crate::assembler::{AssemblerEvent, BlockAssembler};
use crate::journal::Journal;
use crate::link::{LineSource, LinkOpener};
use crate::locator::{DeviceLocator, Located, MatchTier, PortScanner, RoleSelector};
use crate::mesh::MeshtasticLink;
use crate::snapshot::{OfferOutcome, SnapshotStore};

/// Raw lines longer than this are summarized in the echo.
const ECHO_LINE_LIMIT: usize = 150;

/// Counters kept by the sensor worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SensorStats {
    pub lines: u64,
    pub blocks_completed: u64,
    pub blocks_accepted: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

/// A sensor session together with where it was found.
#[derive(Debug)]
pub struct Attached<S> {
    pub source: S,
    pub located: Located,
}

enum Reattach<S> {
    Attached(S),
    Stopped,
    Exhausted,
}

/// Echoes the raw lines of at most one block per interval.
#[derive(Debug)]
struct RawEcho {
    interval: Duration,
    last: Option<Instant>,
    active: bool,
}

impl RawEcho {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            active: false,
        }
    }

    fn block_started(&mut self, now: Instant) {
        self.active = self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if self.active {
            self.last = Some(now);
        }
    }

    fn line(&self, line: &str) {
        if !self.active {
            return;
        }
        let chars = line.chars().count();
        if chars > ECHO_LINE_LIMIT {
            let head: String = line.chars().take(ECHO_LINE_LIMIT).collect();
            tracing::debug!(target: "fieldlink::raw", "{}... ({} chars)", head, chars);
        } else {
            tracing::debug!(target: "fieldlink::raw", "{}", line);
        }
    }

    fn block_finished(&mut self) {
        self.active = false;
    }
}

/// Owns the sensor terminal link for the lifetime of the bridge.
#[derive(Debug)]
pub struct SensorSupervisor<O, P> {
    opener: O,
    locator: DeviceLocator<P>,
    selector: RoleSelector,
    explicit: Option<String>,
    claimed: HashSet<String>,
    reconnect_delay: Duration,
    max_attempts: u32,
    raw_echo_interval: Duration,
    journal: Journal,
}

impl<O: LinkOpener, P: PortScanner> SensorSupervisor<O, P> {
    pub fn new(
        opener: O,
        locator: DeviceLocator<P>,
        selector: RoleSelector,
        explicit: Option<String>,
        journal: Journal,
    ) -> Self {
        Self {
            opener,
            locator,
            selector,
            explicit,
            claimed: HashSet::new(),
            reconnect_delay: Duration::from_secs(5),
            max_attempts: 3,
            raw_echo_interval: Duration::from_secs(60),
            journal,
        }
    }

    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect_delay = delay;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_raw_echo_interval(mut self, interval: Duration) -> Self {
        self.raw_echo_interval = interval;
        self
    }

    /// Mark a port as held by another role so reattachment never takes it.
    pub fn claim(&mut self, path: impl Into<String>) {
        self.claimed.insert(path.into());
    }

    /// Locate and open the sensor terminal.
    ///
    /// `preferred` is tried first; if it cannot be opened, discovery runs
    /// again without it.
    pub async fn attach(&self, preferred: Option<&str>) -> Option<Attached<O::Source>> {
        let mut excluded = self.claimed.clone();
        let mut preferred = preferred.map(str::to_string);

        loop {
            let located = self
                .locator
                .locate(&self.selector, preferred.as_deref(), &excluded)?;

            match self.opener.open(&located.path).await {
                Ok(source) => {
                    tracing::info!(port = %located.path, tier = located.tier.as_str(), "Sensor terminal connected");
                    self.journal.record(
                        "sensor_connected",
                        json!({ "port": located.path, "tier": located.tier }),
                    );
                    return Some(Attached { source, located });
                }
                Err(e) => {
                    tracing::error!(port = %located.path, error = %e, "Failed to open sensor terminal");
                    self.journal.record(
                        "sensor_connect_error",
                        json!({ "port": located.path, "error": e.to_string() }),
                    );
                    if located.tier != MatchTier::Explicit {
                        return None;
                    }
                    tracing::info!(port = %located.path, "Falling back to automatic discovery");
                    excluded.insert(located.path);
                    preferred = None;
                }
            }
        }
    }

    /// Read until shutdown or until the link is lost for good.
    ///
    /// Exhausting the reattach attempts triggers `shutdown`.
    pub async fn run(
        &self,
        attached: Attached<O::Source>,
        store: SnapshotStore,
        shutdown: Shutdown,
    ) -> SensorStats {
        let mut listener = shutdown.listener();
        let mut source = attached.source;
        let mut last_path = attached.located.path;
        let mut assembler = BlockAssembler::new();
        let mut echo = RawEcho::new(self.raw_echo_interval);
        let mut stats = SensorStats::default();

        tracing::info!(port = %last_path, "Sensor worker started");

        loop {
            let next = tokio::select! {
                _ = listener.wait() => break,
                next = source.next_line() => next,
            };

            match next {
                Ok(Some(line)) => {
                    stats.lines += 1;
                    self.handle_line(&line, &mut assembler, &mut echo, &store, &mut stats);
                    continue;
                }
                Ok(None) => {
                    tracing::warn!(port = %last_path, "Sensor terminal disconnected");
                    self.journal
                        .record("sensor_disconnected", json!({ "port": last_path }));
                }
                Err(e) => {
                    tracing::error!(port = %last_path, error = %e, "Sensor read error");
                    self.journal.record(
                        "sensor_read_error",
                        json!({ "port": last_path, "error": e.to_string() }),
                    );
                }
            }

            source.close().await;
            echo.block_finished();
            if let Some(discarded) = assembler.reset() {
                tracing::info!(discarded, "Partial block dropped after link loss");
                self.journal
                    .record("sensor_partial_block_discarded", json!({ "entries": discarded }));
            }

            let preferred = self.explicit.clone().unwrap_or_else(|| last_path.clone());
            match self.reattach(&preferred, &mut listener).await {
                Reattach::Attached(attached) => {
                    stats.reconnects += 1;
                    source = attached.source;
                    last_path = attached.located.path;
                }
                Reattach::Stopped => {
                    tracing::info!(
                        lines = stats.lines,
                        blocks = stats.blocks_completed,
                        "Sensor worker stopped"
                    );
                    return stats;
                }
                Reattach::Exhausted => {
                    shutdown.trigger("sensor terminal lost");
                    return stats;
                }
            }
        }

        source.close().await;
        tracing::info!(lines = stats.lines, blocks = stats.blocks_completed, "Sensor worker stopped");
        stats
    }

    async fn reattach(
        &self,
        preferred: &str,
        listener: &mut ShutdownListener,
    ) -> Reattach<Attached<O::Source>> {
        for attempt in 1..=self.max_attempts {
            tracing::info!(attempt, max_attempts = self.max_attempts, delay_secs = self.reconnect_delay.as_secs(), "Reconnecting to sensor terminal");
            self.journal.record(
                "sensor_reconnect_attempt",
                json!({ "attempt": attempt, "max_attempts": self.max_attempts, "port": preferred }),
            );

            tokio::select! {
                _ = listener.wait() => return Reattach::Stopped,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            if let Some(attached) = self.attach(Some(preferred)).await {
                self.journal.record(
                    "sensor_reconnected",
                    json!({ "attempt": attempt, "port": attached.located.path }),
                );
                return Reattach::Attached(attached);
            }
        }

        tracing::error!(attempts = self.max_attempts, "Sensor terminal could not be reattached");
        self.journal.record(
            "sensor_reconnect_failed",
            json!({ "attempts": self.max_attempts }),
        );
        Reattach::Exhausted
    }

    fn handle_line(
        &self,
        line: &str,
        assembler: &mut BlockAssembler,
        echo: &mut RawEcho,
        store: &SnapshotStore,
        stats: &mut SensorStats,
    ) {
        match assembler.feed(line) {
            AssemblerEvent::Started => {
                echo.block_started(Instant::now());
                echo.line(line);
            }
            AssemblerEvent::Restarted { discarded } => {
                echo.block_started(Instant::now());
                echo.line(line);
                self.journal
                    .record("sensor_block_restarted", json!({ "discarded": discarded }));
            }
            AssemblerEvent::Appended => echo.line(line),
            AssemblerEvent::DeviceTimestampDropped => {
                echo.line(line);
                self.journal
                    .record("sensor_device_timestamp_dropped", json!({ "line": line }));
            }
            AssemblerEvent::Malformed { line } => {
                stats.malformed += 1;
                echo.line(&line);
                self.journal
                    .record("sensor_malformed_line", json!({ "line": line }));
            }
            AssemblerEvent::Completed(block) => {
                echo.line(line);
                echo.block_finished();
                stats.blocks_completed += 1;
                let size = block.len();
                if store.offer(block, Instant::now()) == OfferOutcome::Accepted {
                    stats.blocks_accepted += 1;
                    self.journal
                        .record("sensor_block_updated", json!({ "block_size": size }));
                }
            }
            AssemblerEvent::StrayEnd => {
                self.journal.record("sensor_stray_end_marker", json!({}));
            }
            AssemblerEvent::Blank | AssemblerEvent::Ignored => {}
        }
    }
}

/// Locate and open the mesh radio. Failure is not fatal.
pub async fn attach_mesh_radio<P: PortScanner>(
    locator: &DeviceLocator<P>,
    selector: &RoleSelector,
    explicit: Option<&str>,
    claimed: &HashSet<String>,
    settings: MeshOpenSettings,
    journal: &Journal,
) -> Option<MeshtasticLink<WriteHalf<SerialStream>>> {
    let mut excluded = claimed.clone();
    let mut preferred = explicit.map(str::to_string);

    loop {
        let Some(located) = locator.locate(selector, preferred.as_deref(), &excluded) else {
            tracing::warn!("Mesh radio not found, mesh messages will be skipped");
            journal.record("mesh_unavailable", json!({ "reason": "not found" }));
            return None;
        };

        match MeshtasticLink::open(
            &located.path,
            settings.baud_rate,
            settings.write_timeout,
            settings.hop_limit,
        )
        .await
        {
            Ok(link) => {
                journal.record(
                    "mesh_connected",
                    json!({ "port": located.path, "tier": located.tier }),
                );
                return Some(link);
            }
            Err(e) => {
                tracing::error!(port = %located.path, error = %e, "Failed to open mesh radio");
                journal.record(
                    "mesh_connect_error",
                    json!({ "port": located.path, "error": e.to_string() }),
                );
                if located.tier != MatchTier::Explicit {
                    return None;
                }
                excluded.insert(located.path);
                preferred = None;
            }
        }
    }
}

/// Serial parameters for the mesh radio.
#[derive(Debug, Clone, Copy)]
pub struct MeshOpenSettings {
    pub baud_rate: u32,
    pub write_timeout: Duration,
    pub hop_limit: u32,
}

/// Journal every broker connectivity change until shutdown.
pub async fn journal_link_transitions(
    mut status: LinkStatus,
    journal: Journal,
    mut shutdown: ShutdownListener,
) {
    journal.record(
        "broker_link_state",
        json!({ "state": status.current().as_str() }),
    );
    loop {
        let state = tokio::select! {
            _ = shutdown.wait() => break,
            state = status.changed() => state,
        };
        let Some(state) = state else {
            // Writer gone: the state can no longer change.
            shutdown.wait().await;
            break;
        };
        journal.record("broker_link_state", json!({ "state": state.as_str() }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkError;
    use crate::locator::{LocatorError, MatchRule, PortDescriptor, SENSOR_ROLE};
    use fieldlink_bridge_framework::LinkState;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct ScriptedSource {
        path: String,
        lines: VecDeque<Result<Option<String>, ()>>,
    }

    impl LineSource for ScriptedSource {
        fn path(&self) -> &str {
            &self.path
        }

        async fn next_line(&mut self) -> Result<Option<String>, LinkError> {
            match self.lines.pop_front() {
                Some(Ok(line)) => Ok(line),
                Some(Err(())) => Err(LinkError::Io(std::io::Error::other("device reset"))),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct ScriptedOpener {
        sessions: Arc<Mutex<VecDeque<Vec<Result<Option<String>, ()>>>>>,
        opened: Arc<Mutex<Vec<String>>>,
        refuse: Arc<Mutex<HashSet<String>>>,
    }

    impl LinkOpener for ScriptedOpener {
        type Source = ScriptedSource;

        async fn open(&self, path: &str) -> Result<ScriptedSource, LinkError> {
            self.opened.lock().push(path.to_string());
            if self.refuse.lock().contains(path) {
                return Err(LinkError::Closed);
            }
            let lines = self.sessions.lock().pop_front().unwrap_or_default();
            Ok(ScriptedSource {
                path: path.to_string(),
                lines: lines.into(),
            })
        }
    }

    struct Ports(Vec<PortDescriptor>);

    impl PortScanner for Ports {
        fn scan(&self) -> Result<Vec<PortDescriptor>, LocatorError> {
            Ok(self.0.clone())
        }
    }

    fn wio(path: &str) -> PortDescriptor {
        PortDescriptor {
            path: path.to_string(),
            description: Some("Wio Terminal".to_string()),
            vid: Some(0x2886),
            pid: Some(0x802F),
            ..Default::default()
        }
    }

    fn line(s: &str) -> Result<Option<String>, ()> {
        Ok(Some(s.to_string()))
    }

    fn selector() -> RoleSelector {
        RoleSelector::new(
            SENSOR_ROLE,
            vec![MatchRule::Keyword {
                keywords: vec!["Wio".to_string()],
            }],
        )
    }

    fn supervisor(opener: ScriptedOpener, ports: Vec<PortDescriptor>) -> SensorSupervisor<ScriptedOpener, Ports> {
        SensorSupervisor::new(
            opener,
            DeviceLocator::new(Ports(ports), Journal::disabled()),
            selector(),
            None,
            Journal::disabled(),
        )
        .with_reconnect(Duration::from_secs(5), 3)
    }

    #[tokio::test]
    async fn test_explicit_failure_falls_through() {
        let opener = ScriptedOpener::default();
        opener.refuse.lock().insert("/dev/ttyACM9".to_string());
        let sup = supervisor(opener.clone(), vec![wio("/dev/ttyACM1")]);

        let attached = sup.attach(Some("/dev/ttyACM9")).await.unwrap();
        assert_eq!(attached.located.path, "/dev/ttyACM1");
        assert_eq!(attached.located.tier, MatchTier::Keyword);
        assert_eq!(*opener.opened.lock(), vec!["/dev/ttyACM9", "/dev/ttyACM1"]);
    }

    #[tokio::test]
    async fn test_claimed_port_not_attached() {
        let mut sup = supervisor(ScriptedOpener::default(), vec![wio("/dev/ttyACM1")]);
        sup.claim("/dev/ttyACM1");
        assert!(sup.attach(None).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_keeps_blocks_clean() {
        let opener = ScriptedOpener::default();
        opener.sessions.lock().extend([
            vec![
                line("START_DATA"),
                line("TEMP:20.0 C"),
                line("END_DATA"),
                line("START_DATA"),
                line("TEMP:99.0 C"),
                Err(()),
            ],
            vec![line("HUMIDITY:40 %"), line("END_DATA"), line("START_DATA"), line("TEMP:21.0 C"), line("END_DATA")],
        ]);
        let sup = supervisor(opener.clone(), vec![wio("/dev/ttyACM1")]);
        let store = SnapshotStore::new(Duration::ZERO, Instant::now());
        let reader = store.reader();
        let shutdown = Shutdown::new();

        let attached = sup.attach(None).await.unwrap();
        let run_shutdown = shutdown.clone();
        let task = tokio::spawn(async move { sup.run(attached, store, run_shutdown).await });

        tokio::time::sleep(Duration::from_secs(6)).await;
        shutdown.trigger("test");
        let stats = task.await.unwrap();

        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.blocks_completed, 2);
        assert_eq!(*opener.opened.lock(), vec!["/dev/ttyACM1", "/dev/ttyACM1"]);

        let latest = reader.latest().unwrap();
        assert_eq!(latest.block().get("TEMP").unwrap().value, "21.0 C");
        assert!(latest.block().get("HUMIDITY").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reattach_triggers_shutdown() {
        let opener = ScriptedOpener::default();
        opener.sessions.lock().push_back(vec![Ok(None)]);
        let sup = supervisor(opener.clone(), vec![wio("/dev/ttyACM1")]);
        let shutdown = Shutdown::new();

        let attached = sup.attach(None).await.unwrap();
        opener.refuse.lock().insert("/dev/ttyACM1".to_string());

        let stats = sup
            .run(attached, SnapshotStore::new(Duration::ZERO, Instant::now()), shutdown.clone())
            .await;
        assert!(shutdown.is_triggered());
        assert_eq!(stats.reconnects, 0);
        // Initial open plus one per attempt.
        assert_eq!(opener.opened.lock().len(), 4);
    }

    #[test]
    fn test_raw_echo_throttle() {
        let t0 = Instant::now();
        let mut echo = RawEcho::new(Duration::from_secs(60));
        echo.block_started(t0);
        assert!(echo.active);
        echo.block_finished();
        echo.block_started(t0 + Duration::from_secs(30));
        assert!(!echo.active);
        echo.block_started(t0 + Duration::from_secs(60));
        assert!(echo.active);
    }

    fn journal_text(journal: &Journal) -> String {
        std::fs::read_to_string(journal.path().unwrap()).unwrap_or_default()
    }

    async fn wait_for_entries(journal: &Journal, needle: &str, count: usize) {
        for _ in 0..200 {
            if journal_text(journal).matches(needle).count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("journal never reached {count} x {needle}");
    }

    #[tokio::test]
    async fn test_device_timestamp_drop_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open_at(dir.path(), "t", chrono::Local::now());
        let opener = ScriptedOpener::default();
        opener.sessions.lock().push_back(vec![
            line("START_DATA"),
            line("TIMESTAMP:123456"),
            line("TEMP:20.0 C"),
            line("END_DATA"),
        ]);
        let sup = SensorSupervisor::new(
            opener,
            DeviceLocator::new(Ports(vec![wio("/dev/ttyACM1")]), Journal::disabled()),
            selector(),
            None,
            journal.clone(),
        );
        let store = SnapshotStore::new(Duration::ZERO, Instant::now());
        let reader = store.reader();
        let shutdown = Shutdown::new();

        let attached = sup.attach(None).await.unwrap();
        let run_shutdown = shutdown.clone();
        let task = tokio::spawn(async move { sup.run(attached, store, run_shutdown).await });
        wait_for_entries(&journal, "sensor_block_updated", 1).await;

        shutdown.trigger("test");
        task.await.unwrap();
        journal.close();

        let content = journal_text(&journal);
        assert_eq!(content.matches("sensor_device_timestamp_dropped").count(), 1);
        assert!(content.contains("\"line\":\"TIMESTAMP:123456\""));
        assert!(reader.latest().unwrap().block().get("TIMESTAMP").is_none());
    }

    #[tokio::test]
    async fn test_link_transitions_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open_at(dir.path(), "t", chrono::Local::now());
        let (tx, status) = LinkStatus::channel(LinkState::Connecting);
        let shutdown = Shutdown::new();

        let task = tokio::spawn(journal_link_transitions(status, journal.clone(), shutdown.listener()));
        wait_for_entries(&journal, "\"state\":\"connecting\"", 1).await;

        tx.send_replace(LinkState::Connected);
        wait_for_entries(&journal, "\"state\":\"connected\"", 1).await;

        shutdown.trigger("test");
        task.await.unwrap();
        journal.close();

        let content = journal_text(&journal);
        assert_eq!(content.matches("broker_link_state").count(), 2);
    }

    #[tokio::test]
    async fn test_link_state_before_start_journaled_once() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open_at(dir.path(), "t", chrono::Local::now());
        let (tx, status) = LinkStatus::channel(LinkState::Connecting);
        let shutdown = Shutdown::new();

        // The watch moves on before the journaling task first looks at it.
        tx.send_replace(LinkState::Connected);
        let task = tokio::spawn(journal_link_transitions(status, journal.clone(), shutdown.listener()));
        wait_for_entries(&journal, "broker_link_state", 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.trigger("test");
        task.await.unwrap();
        journal.close();

        let content = journal_text(&journal);
        assert_eq!(content.matches("broker_link_state").count(), 1);
        assert!(content.contains("\"state\":\"connected\""));
        assert!(!content.contains("\"state\":\"connecting\""));
    }
}
