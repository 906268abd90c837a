//! logflume in-tail plugin binary.
//!
//! Speaks the framed logflume protocol on standard input and output, writes
//! human diagnostics to standard error, and hosts one [`TailInput`] unit per
//! unit id the parent addresses. Lifetime is controlled exclusively by the
//! parent: SIGINT is ignored and the process exits after the
//! `Stop`/`Terminated` exchange (or on pipe EOF).
//!
//! Exits non-zero only when the stdout redirection that protects the framed
//! channel cannot be established.

use logflume::runtime::PluginRuntime;
use logflume::tail::TailInput;

#[tokio::main]
async fn main() {
    logflume::logging::init_plugin_logging();

    let runtime = PluginRuntime::new("in-tail", TailInput::factory);
    if let Err(e) = runtime.run().await {
        tracing::error!(error = %e, "plugin startup failed");
        std::process::exit(1);
    }
}
