use std::env;

/// Diagnostic trace switch, injected into the scanner and demuxer.
///
/// Call sites test `enabled` and write single-line records to stderr. There
/// is no process-wide logger: embedders pass [`Trace::disabled`] (or their
/// own setting) to the `*_with_trace` constructors.
#[derive(Debug, Clone, Copy)]
pub struct Trace {
    pub enabled: bool,
}

impl Trace {
    /// Read the default setting from the `AVC_DEMUX_TRACE` environment variable.
    pub fn from_env() -> Self {
        let enabled = matches!(
            env::var("AVC_DEMUX_TRACE").as_deref(),
            Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
        );
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }
}
