//! Test helpers shared across topology tests.

use parking_lot::{Condvar, Mutex};

use crate::context::Context;
use crate::tuple::Tuple;

use super::error::TopologyError;
use super::traits::{Sink, Writer};

/// A sink that collects every tuple it receives and lets tests block until
/// a given number has arrived.
#[derive(Default)]
pub(crate) struct TupleCollectorSink {
    tuples: Mutex<Vec<Tuple>>,
    arrived: Condvar,
}

impl TupleCollectorSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the number of collected tuples.
    pub(crate) fn len(&self) -> usize {
        self.tuples.lock().len()
    }

    /// Blocks until at least `n` tuples have been collected.
    pub(crate) fn wait(&self, n: usize) {
        let mut tuples = self.tuples.lock();
        while tuples.len() < n {
            self.arrived.wait(&mut tuples);
        }
    }

    /// Returns a snapshot of the collected tuples.
    pub(crate) fn snapshot(&self) -> Vec<Tuple> {
        self.tuples.lock().clone()
    }
}

impl Writer for TupleCollectorSink {
    fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<(), TopologyError> {
        let mut tuples = self.tuples.lock();
        tuples.push(tuple);
        self.arrived.notify_all();
        Ok(())
    }
}

impl Sink for TupleCollectorSink {
    fn close(&self, _ctx: &Context) -> Result<(), TopologyError> {
        Ok(())
    }
}
