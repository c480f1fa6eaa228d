//! Periodic task intervals and the actor-owned schedule.
//!
//! The mesh actor wakes on a single `tick` interval and asks the [`Schedule`]
//! which tasks are due. Each task keeps its own next-due instant, so a slow
//! task never shifts the others. Deferred one-shot work (re-optimisation after a
//! rejection) is an optional deadline that is cleared when the mesh stops.

use std::time::{Duration, Instant};

pub const DEFAULT_TICK: Duration = Duration::from_millis(250);
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_LINK_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_STALE_PEER_MAX_AGE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_OPTIMIZE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DHT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_GOSSIP_TRIM_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REJECTION_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MaintenanceConfig {
    /// Granularity of the actor's timer wheel.
    pub tick: Duration,
    /// Keepalive pings, stale-link detection and attempt expiry.
    pub health_check_interval: Duration,
    /// A dial that has not connected within this window is abandoned.
    pub attempt_timeout: Duration,
    /// A connected link with no inbound traffic for this long is stale.
    pub stale_link_timeout: Duration,
    /// Discovered peers not seen for this long are forgotten.
    pub stale_peer_max_age: Duration,
    pub prune_interval: Duration,
    pub optimize_interval: Duration,
    pub dht_sweep_interval: Duration,
    pub gossip_trim_interval: Duration,
    pub announce_interval: Duration,
    pub rejection_retry_delay: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            stale_link_timeout: DEFAULT_STALE_LINK_TIMEOUT,
            stale_peer_max_age: DEFAULT_STALE_PEER_MAX_AGE,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            optimize_interval: DEFAULT_OPTIMIZE_INTERVAL,
            dht_sweep_interval: DEFAULT_DHT_SWEEP_INTERVAL,
            gossip_trim_interval: DEFAULT_GOSSIP_TRIM_INTERVAL,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            rejection_retry_delay: DEFAULT_REJECTION_RETRY_DELAY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    HealthCheck,
    PrunePeers,
    Optimize,
    DhtSweep,
    GossipTrim,
    Announce,
}

const TASK_COUNT: usize = 6;

const ALL_TASKS: [Task; TASK_COUNT] = [
    Task::HealthCheck,
    Task::PrunePeers,
    Task::Optimize,
    Task::DhtSweep,
    Task::GossipTrim,
    Task::Announce,
];

#[derive(Debug)]
pub struct Schedule {
    config: MaintenanceConfig,
    next: [Option<Instant>; TASK_COUNT],
    deferred_optimize: Option<Instant>,
}

impl Schedule {
    pub fn new(config: MaintenanceConfig) -> Self {
        Self {
            config,
            next: [None; TASK_COUNT],
            deferred_optimize: None,
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    fn interval(&self, task: Task) -> Duration {
        match task {
            Task::HealthCheck => self.config.health_check_interval,
            Task::PrunePeers => self.config.prune_interval,
            Task::Optimize => self.config.optimize_interval,
            Task::DhtSweep => self.config.dht_sweep_interval,
            Task::GossipTrim => self.config.gossip_trim_interval,
            Task::Announce => self.config.announce_interval,
        }
    }

    fn slot(task: Task) -> usize {
        task as usize
    }

    /// Arm every periodic task, first run one interval from `now`.
    pub fn start(&mut self, now: Instant) {
        for task in ALL_TASKS {
            self.next[Self::slot(task)] = Some(now + self.interval(task));
        }
    }

    /// Disarm everything, including deferred work.
    pub fn stop(&mut self) {
        self.next = [None; TASK_COUNT];
        self.deferred_optimize = None;
    }

    pub fn is_running(&self) -> bool {
        self.next.iter().any(Option::is_some)
    }

    /// Tasks due at `now`. Each returned task is re-armed one interval later.
    pub fn due(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        for task in ALL_TASKS {
            let slot = Self::slot(task);
            if let Some(at) = self.next[slot]
                && at <= now
            {
                self.next[slot] = Some(now + self.interval(task));
                due.push(task);
            }
        }
        due
    }

    /// Run an optimisation after `rejection_retry_delay`, keeping an earlier
    /// deadline if one is already set.
    pub fn defer_optimize(&mut self, now: Instant) {
        let at = now + self.config.rejection_retry_delay;
        self.deferred_optimize = Some(match self.deferred_optimize {
            Some(existing) if existing < at => existing,
            _ => at,
        });
    }

    pub fn take_deferred_optimize(&mut self, now: Instant) -> bool {
        match self.deferred_optimize {
            Some(at) if at <= now => {
                self.deferred_optimize = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_deferred_optimize(&self) -> bool {
        self.deferred_optimize.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> MaintenanceConfig {
        MaintenanceConfig {
            health_check_interval: Duration::from_millis(10),
            optimize_interval: Duration::from_millis(20),
            ..MaintenanceConfig::default()
        }
    }

    #[test]
    fn nothing_due_before_start() {
        let mut schedule = Schedule::new(fast_config());
        assert!(schedule.due(Instant::now() + Duration::from_secs(3600)).is_empty());
        assert!(!schedule.is_running());
    }

    #[test]
    fn tasks_fire_on_their_own_interval() {
        let mut schedule = Schedule::new(fast_config());
        let start = Instant::now();
        schedule.start(start);

        let due = schedule.due(start + Duration::from_millis(15));
        assert_eq!(due, vec![Task::HealthCheck]);

        let due = schedule.due(start + Duration::from_millis(30));
        assert!(due.contains(&Task::HealthCheck));
        assert!(due.contains(&Task::Optimize));
        assert!(!due.contains(&Task::Announce));
    }

    #[test]
    fn stop_cancels_deferred_work() {
        let mut schedule = Schedule::new(fast_config());
        let now = Instant::now();
        schedule.start(now);
        schedule.defer_optimize(now);
        assert!(schedule.has_deferred_optimize());

        schedule.stop();
        assert!(!schedule.take_deferred_optimize(now + Duration::from_secs(5)));
        assert!(schedule.due(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn deferred_optimize_fires_once() {
        let mut schedule = Schedule::new(fast_config());
        let now = Instant::now();
        schedule.defer_optimize(now);
        assert!(!schedule.take_deferred_optimize(now));
        let later = now + DEFAULT_REJECTION_RETRY_DELAY;
        assert!(schedule.take_deferred_optimize(later));
        assert!(!schedule.take_deferred_optimize(later));
    }
}
