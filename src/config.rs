use std::fmt::Display;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::types::QueueDiscipline;
use crate::types::ResponseType;

pub const DEFAULT_BUNCH_SIZE: usize = 500;
pub const DEFAULT_AGGREGATION_WINDOW_MS: u64 = 200;
pub const DEFAULT_CONCURRENCY: usize = 6;
pub const DEFAULT_LOW_WATER_MARK: usize = 2;
pub const DEFAULT_HIGH_WATER_MARK: usize = 6;

/// Settings of an [`EntityManager`](crate::EntityManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ManagerConfig {
    /// Resource path all requests of the manager are sent to.
    #[garde(length(min = 1), custom(not_blank))]
    pub base_path: String,

    #[garde(skip)]
    pub response_type: ResponseType,

    /// Maximum number of keys in a single batch read.
    #[garde(range(min = 1))]
    pub bunch_size: usize,

    /// How long to keep collecting keys before they're flushed into batch reads. Every new key restarts the window.
    #[garde(skip)]
    pub aggregation_window_ms: u64,

    /// Maximum number of simultaneous transport calls.
    #[garde(range(min = 1))]
    pub concurrency: usize,

    #[garde(skip)]
    pub queue_discipline: QueueDiscipline,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_path:             String::new(),
            response_type:         ResponseType::Json,
            bunch_size:            DEFAULT_BUNCH_SIZE,
            aggregation_window_ms: DEFAULT_AGGREGATION_WINDOW_MS,
            concurrency:           DEFAULT_CONCURRENCY,
            queue_discipline:      QueueDiscipline::Fifo,
        }
    }
}

impl ManagerConfig {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    pub fn with_bunch_size(mut self, bunch_size: usize) -> Self {
        self.bunch_size = bunch_size;
        self
    }

    pub fn with_aggregation_window(mut self, window: Duration) -> Self {
        self.aggregation_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_queue_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.queue_discipline = discipline;
        self
    }

    #[inline]
    pub fn aggregation_window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        Ok(self.validate()?)
    }
}

/// Settings of a [`Coalescer`](crate::Coalescer).
///
/// The queue is only drained when the number of in-flight calls drops to `low_water_mark` or below, and then it is
/// drained until `high_water_mark` calls are in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CoalescerConfig {
    #[garde(custom(not_above("high_water_mark", &self.high_water_mark)))]
    pub low_water_mark: usize,

    #[garde(range(min = 1))]
    pub high_water_mark: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            low_water_mark:  DEFAULT_LOW_WATER_MARK,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

impl CoalescerConfig {
    pub fn new(low_water_mark: usize, high_water_mark: usize) -> Self {
        Self {
            low_water_mark,
            high_water_mark,
        }
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        Ok(self.validate()?)
    }
}

fn not_blank(value: &str, _: &()) -> garde::Result {
    if value.trim().is_empty() {
        Err(garde::Error::new("must not be blank"))
    }
    else {
        Ok(())
    }
}

fn not_above<'a, T: PartialOrd + Display>(max_name: &'static str, max: &'a T) -> impl FnOnce(&'a T, &()) -> garde::Result {
    move |value, _| {
        if value > max {
            Err(garde::Error::new(format!("{value} is more than {max_name} ({max})")))
        }
        else {
            Ok(())
        }
    }
}
