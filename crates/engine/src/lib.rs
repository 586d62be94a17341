//! Ripple Engine - runs incremental computations commit by commit.
//!
//! This crate ties the operator graph of `ripple-incremental` to its surroundings:
//!
//! - `Coordinator`: groups pushed rows into commits and assigns timestamps
//! - `Computation`: evaluates commits, delivers them to sinks, snapshots and recovers
//! - `Reader` / `Runner`: pull input from connectors and cut commits
//! - `OutputSink` / `ErrorSink`: receive output changes and routed data errors
//! - `EngineConfig` / `logging`: configuration and log output
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{Row, Schema, Timestamp, Value};
//! use ripple_engine::{CollectingSink, Computation, EngineConfig, Runner, VecReader};
//! use ripple_incremental::{GraphBuilder, Reducer, SourceEvent};
//!
//! let mut builder = GraphBuilder::new();
//! let readings = builder.source("readings", Schema::untyped(["sensor", "value"]));
//! let peaks = builder.reduce(readings, vec![0], vec![Reducer::Max(1)]);
//! builder.output(peaks, "peaks");
//!
//! let mut computation = Computation::new(builder.build().unwrap(), EngineConfig::default()).unwrap();
//! let sink = CollectingSink::new();
//! computation.subscribe("peaks", sink.clone()).unwrap();
//!
//! let reading = |id: u64, value: i64| {
//!     SourceEvent::insert(Row::new(id, vec![Value::from("s1"), Value::Int64(value)]))
//! };
//! let mut runner = Runner::new(computation);
//! runner
//!     .add_reader("readings", VecReader::batches(vec![vec![reading(1, 8)], vec![reading(2, 10)]]))
//!     .unwrap();
//! let summary = runner.run().unwrap();
//! assert_eq!(summary.last_time, Timestamp(2));
//! assert_eq!(sink.at(Timestamp(2)).len(), 2);
//! ```

pub mod computation;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod logging;
pub mod sink;

pub use computation::Computation;
pub use config::{CommitConfig, EngineConfig, PersistenceConfig};
pub use connector::{ReadResult, Reader, RunOutcome, RunSummary, Runner, VecReader};
pub use coordinator::{Batch, ClockHandle, CommitPhase, Coordinator, ShutdownHandle};
pub use logging::LoggingConfig;
pub use sink::{CallbackSink, ChangeCallback, CollectingSink, ErrorSink, OutputSink};
