mod fake_driver;

pub use fake_driver::{FakeDriver, FakeDriverStats, FakeQueryOutcome};
