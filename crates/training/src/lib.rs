//! Training and evaluation harness for list-wise click models.
//!
//! The `train` binary is a thin wrapper around [`driver::run`].

pub mod algorithm;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod driver;
pub mod executor;
pub mod feed;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod task;

pub use algorithm::{EvalAlgorithm, InferenceOutputs, SamplingOutputs, TestOutputs, TrainOutputs};
pub use config::{Config, ConfigOverride, ModelSettings, OptimizerType, TrainingError};
pub use driver::{build_task, run, Args, RunOutcome, Task};
pub use executor::{
    ExecutionStrategy, Executor, InferenceFetch, ParallelExecutor, SamplingFetch, SingleExecutor,
    TestFetch, TrainFetch, TrainMode,
};
pub use feed::{create_tensor, FeedConvertor, TrainFeed};
pub use logging::{add_scalar_summary, SummaryWriter};
pub use loss::CrossEntropyLoss;
pub use metrics::{AucMetrics, SequenceCorrelationMetrics, SequenceRmseMetrics};
pub use optimizer::{AdamConfig, OptimizerConfig, SgdConfig, TrainerOptimizer};
pub use task::EvalComputationTask;
