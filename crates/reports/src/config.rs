//! Controller and queue configuration.

use std::time::Duration;

/// Report controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Worker threads executing generators
    pub max_workers: usize,
    /// Submissions that may wait for a free worker before `start` fails fast
    pub max_queue_size: usize,
    /// Wall-clock limit for a running task
    pub task_timeout: Duration,
    /// How long terminal tasks stay queryable after their last update
    pub retention: Duration,
    /// Period of the timeout/retention sweep
    pub sweep_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue_size: 100,
            task_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ceiling on tasks active in the controller at once
    pub max_concurrent_tasks: usize,
    /// Capacity of the ready heap and, separately, of the delayed heap
    pub max_queue_size: usize,
    /// Fixed delay before a failed task is retried
    pub retry_delay: Duration,
    /// Retries granted to tasks that don't set their own
    pub default_max_retries: u32,
    /// Dispatcher idle poll
    pub dispatch_interval: Duration,
    /// Delayed-heap poll
    pub promotion_interval: Duration,
    /// Per-task monitor poll
    pub monitor_interval: Duration,
    /// Bound of the failed list (and of the finished history)
    pub max_failed_tasks: usize,
    /// How long `shutdown` waits for background threads
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            max_queue_size: 1000,
            retry_delay: Duration::from_secs(60),
            default_max_retries: 3,
            dispatch_interval: Duration::from_secs(1),
            promotion_interval: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(2),
            max_failed_tasks: 1000,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_promotion_interval(mut self, interval: Duration) -> Self {
        self.promotion_interval = interval;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_max_failed_tasks(mut self, max: usize) -> Self {
        self.max_failed_tasks = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
