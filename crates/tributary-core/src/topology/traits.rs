//! Contracts between the runtime and user-defined components.
//!
//! Everything outside the core interacts with it through these traits:
//! boxes and sinks consume tuples as [`Writer`]s, sources produce them via
//! [`Source::generate_stream`], and live reconfiguration goes through
//! [`Updater`]. Implementations must be `Send + Sync`: the fan-in
//! aggregator may invoke a writer from several threads at once (bounded by
//! its `parallelism`).

use crate::context::Context;
use crate::data::Map;
use crate::tuple::Tuple;

use super::error::TopologyError;

/// Consumer of tuples.
///
/// Implemented by boxes and sinks, and by the fan-out distributor itself.
/// `write` may block briefly (downstream backpressure) and must tolerate up
/// to `parallelism` concurrent callers. Returning an error does not
/// terminate the caller; the fan-in aggregator counts the error and keeps
/// going.
pub trait Writer: Send + Sync {
    /// Consumes one tuple.
    ///
    /// # Errors
    ///
    /// Implementation-defined; surfaced as [`TopologyError::UserWrite`]
    /// statistics by the calling aggregator.
    fn write(&self, ctx: &Context, tuple: Tuple) -> Result<(), TopologyError>;
}

/// Adapts a closure into a [`Writer`].
pub struct WriterFunc<F>(
    /// The wrapped write function.
    pub F,
);

impl<F> Writer for WriterFunc<F>
where
    F: Fn(&Context, Tuple) -> Result<(), TopologyError> + Send + Sync,
{
    fn write(&self, ctx: &Context, tuple: Tuple) -> Result<(), TopologyError> {
        (self.0)(ctx, tuple)
    }
}

/// Producer of tuples; the origin role of a topology.
///
/// `generate_stream` runs on the owning node's thread until the stream is
/// exhausted or `stop` is called. `stop` must be idempotent and safe to call
/// from another thread while `generate_stream` is running; it makes
/// `generate_stream` return promptly.
///
/// A source that can replay its stream from the beginning additionally
/// overrides [`rewindable`](Source::rewindable) and
/// [`rewind`](Source::rewind); after a rewind the node calls
/// `generate_stream` again, alternating emit and pause phases until stopped.
pub trait Source: Send + Sync {
    /// Produces tuples into `writer` until completion or stop.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Source`] (or any error) on failure; the
    /// owning node stops its subtree.
    fn generate_stream(&self, ctx: &Context, writer: &dyn Writer) -> Result<(), TopologyError>;

    /// Requests that `generate_stream` return. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot shut down cleanly.
    fn stop(&self, ctx: &Context) -> Result<(), TopologyError>;

    /// Returns true if this source supports [`rewind`](Source::rewind).
    fn rewindable(&self) -> bool {
        false
    }

    /// Resets the source to replay its stream from the beginning.
    ///
    /// # Errors
    ///
    /// The default implementation always fails with
    /// [`TopologyError::Rewind`].
    fn rewind(&self, _ctx: &Context) -> Result<(), TopologyError> {
        Err(TopologyError::Rewind("source".to_owned()))
    }
}

/// Transform role of a topology: consumes from its inputs, emits to its
/// outputs.
///
/// `process` receives one tuple and emits zero or more tuples through
/// `emitter` (the node's fan-out distributor). It may be invoked
/// concurrently when the node's fan-in parallelism is greater than one; any
/// ordering requirement beyond a single emitter call is the
/// implementation's responsibility.
pub trait Operator: Send + Sync {
    /// Processes one tuple, emitting results through `emitter`.
    ///
    /// # Errors
    ///
    /// Errors are counted by the owning node and the stream continues.
    fn process(
        &self,
        ctx: &Context,
        tuple: Tuple,
        emitter: &dyn Writer,
    ) -> Result<(), TopologyError>;
}

/// Terminus role of a topology: consumes tuples only.
pub trait Sink: Writer {
    /// Releases the sink's resources. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot shut down cleanly.
    fn close(&self, ctx: &Context) -> Result<(), TopologyError>;
}

/// Live reconfiguration of sources, sinks, and shared states.
///
/// The implementer validates parameter names, types, and ranges; rejected
/// parameters surface as [`TopologyError::Parameter`].
pub trait Updater: Send + Sync {
    /// Applies new configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Parameter`] for invalid parameters.
    fn update(&self, ctx: &Context, params: &Map) -> Result<(), TopologyError>;
}
