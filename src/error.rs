use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SynthError {
    /// The baseline observation carries fewer ads than the configured
    /// minimum; there is nothing to learn from this site.
    #[error("Baseline feedback is invalid: {0}")]
    InvalidSiteFeedback(String),

    #[error("Action space has not been built yet")]
    MissingActionSpace,

    #[error("Site root has no derivable eSLD: {0}")]
    RootMissing(String),

    #[error("No valid site snapshot could be loaded from {0}")]
    NoValidSnapshots(Utf8PathBuf),

    #[error("No viable arms left after initialization")]
    NoViableArms,

    #[error("Policy invariant breach: {0}")]
    PolicyMissingQValue(String),

    #[error("Error in the action space: {0}")]
    ActionSpace(#[from] ActionSpaceError),

    #[error("Error while loading a snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Error while reading a request trace: {0}")]
    Trace(#[from] TraceError),

    #[error("Error while evaluating a rule set: {0}")]
    Matcher(#[from] MatcherError),

    #[error("Pull failed: {0}")]
    Pull(#[from] PullError),

    #[error("Failed to persist results: {0}")]
    Persist(#[from] PersistError),
}

#[derive(Debug, Error)]
pub enum ActionSpaceError {
    #[error("Missing eSLD node `{0}` while attaching a FQDN arm")]
    MissingEsld(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to read snapshot file `{0}`: {1}")]
    FileRead(Utf8PathBuf, std::io::Error),

    #[error("Malformed GraphML in `{0}`: {1}")]
    Graphml(Utf8PathBuf, String),

    #[error("Snapshot `{0}` has no ads or no page content")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Failed to read trace file `{0}`: {1}")]
    FileRead(Utf8PathBuf, std::io::Error),

    #[error("Trace file `{0}` is neither a JSON array nor JSON lines")]
    Shape(Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("Rule `{0}` could not be compiled: {1}")]
    BadRule(String, String),
}

#[derive(Debug, Error)]
pub enum PullError {
    #[error("Pull for `{0}` timed out")]
    Timeout(String),

    #[error("Pull for `{0}` failed: {1}")]
    Failed(String, String),

    #[error("Worker panicked during pull for `{0}`: {1}")]
    Panicked(String, String),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to create directory `{0}`: {1}")]
    CreateDir(Utf8PathBuf, std::io::Error),

    #[error("Failed to write file `{0}`: {1}")]
    FileWrite(Utf8PathBuf, std::io::Error),

    #[error("Failed to encode `{0}`: {1}")]
    Encode(Utf8PathBuf, String),
}
