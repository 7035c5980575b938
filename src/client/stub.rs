//! Scripted SRV resolver for tests.

use crate::{record::RawSrvRecord, resolver::SrvResolver};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use super::lock;

pub(crate) const STUB_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[error("stub transport failure")]
pub(crate) struct StubError;

/// What the stub does on one call.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Records(Vec<RawSrvRecord>),
    /// Records valid for the given TTL instead of [`STUB_TTL`].
    RecordsWithTtl(Vec<RawSrvRecord>, Duration),
    Empty,
    Fail,
    /// Never completes.
    Hang,
    /// Sleeps before performing the inner step.
    Delay(Duration, Box<Step>),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Plays back its steps in order, repeating the last one forever.
#[derive(Debug)]
pub(crate) struct Stub {
    steps: Mutex<VecDeque<Step>>,
    calls: Calls,
}

impl Stub {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Calls::default(),
        }
    }

    pub(crate) fn calls(&self) -> Calls {
        self.calls.clone()
    }

    fn next_step(&self) -> Step {
        let mut steps = lock(&self.steps);
        match steps.len() {
            0 => Step::Empty,
            1 => steps[0].clone(),
            _ => steps.pop_front().unwrap_or(Step::Empty),
        }
    }
}

async fn perform(mut step: Step) -> Result<(Vec<RawSrvRecord>, Instant), StubError> {
    while let Step::Delay(delay, inner) = step {
        tokio::time::sleep(delay).await;
        step = *inner;
    }
    match step {
        Step::Records(records) => Ok((records, Instant::now() + STUB_TTL)),
        Step::RecordsWithTtl(records, ttl) => Ok((records, Instant::now() + ttl)),
        Step::Empty => Ok((Vec::new(), Instant::now())),
        Step::Fail => Err(StubError),
        Step::Hang => std::future::pending().await,
        Step::Delay(..) => unreachable!("delays are unwrapped above"),
    }
}

#[async_trait]
impl SrvResolver for Stub {
    type Record = RawSrvRecord;
    type Error = StubError;

    async fn get_srv_records_unordered(
        &self,
        _srv: &str,
    ) -> Result<(Vec<Self::Record>, Instant), Self::Error> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        perform(step).await
    }
}
