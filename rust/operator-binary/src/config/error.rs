use snafu::Snafu;

use super::selector::SelectorError;

/// Errors the Configuration Merger can fail with (its contract:
/// `UnmarshalError` when the cluster-wide document can't be parsed,
/// `SelectorError` when a conditional's annotation selector is invalid).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MergeError {
    #[snafu(display("failed to unmarshal {field} from the instance-manager ConfigMap"))]
    Unmarshal {
        field: &'static str,
        source: serde_yaml::Error,
    },

    #[snafu(display("invalid annotation selector on conditional {index}"))]
    Selector {
        index: usize,
        source: SelectorError,
    },
}
