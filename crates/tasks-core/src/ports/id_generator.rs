//! ID の採番
//!
//! storage は `create_task` ごとに `TaskId` を、runner は起動時に `RunnerId` を採番します。

use std::sync::Mutex;
use std::time::SystemTime;

use ulid::{Generator, Ulid};

use crate::domain::{RunnerId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_runner_id(&self) -> RunnerId;
}

/// timestamp 部分を `Clock` から取る ULID 採番器。
///
/// 単調増加なので、同じミリ秒（`FixedClock` なら常に）に採番した ID も
/// 採番順に並びます。
pub struct UlidGenerator<C> {
    clock: C,
    monotonic: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        UlidGenerator {
            clock,
            monotonic: Mutex::new(Generator::new()),
        }
    }

    fn next(&self) -> Ulid {
        let at = SystemTime::from(self.clock.now());
        let mut monotonic = self.monotonic.lock().unwrap_or_else(|e| e.into_inner());
        // random bits ran out within one millisecond
        monotonic.generate_from_datetime(at).unwrap_or_else(|_| {
            let millis = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
            Ulid::from_parts(millis, rand::random())
        })
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        self.next().into()
    }

    fn generate_runner_id(&self) -> RunnerId {
        self.next().into()
    }
}
