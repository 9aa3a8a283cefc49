use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The performance report a problem-workflow container writes to
/// `perf/performance.json` at the end of the perf step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Perfuplet {
    /// Aggregate score of the freshly trained model.
    pub perf: f64,
    /// Per-metric scores on the train datasets.
    #[serde(default)]
    pub train_perf: HashMap<String, f64>,
    /// Per-metric scores on the (hidden) test datasets.
    #[serde(default)]
    pub test_perf: HashMap<String, f64>,
}
