//! Wires `orchestrator_core::guardrail::Redactor` into the `tracing` output
//! stream when `REDACTION_ENABLED` is set, so a secret-shaped substring that
//! ends up in a log line (e.g. an error message echoing a malformed request)
//! never reaches stdout unredacted. `guardrail.rs` lives in
//! `orchestrator-core`, which has no `tracing-subscriber` dependency, so the
//! `MakeWriter` wiring itself lives here instead.

use std::io;

use orchestrator_core::guardrail::Redactor;
use tracing_subscriber::fmt::MakeWriter;

/// Read once at startup; none of the daemons support toggling this without a
/// restart.
pub fn redaction_enabled() -> bool {
    matches!(std::env::var("REDACTION_ENABLED").as_deref(), Ok("1") | Ok("true"))
}

/// Installs the global `tracing` subscriber with an `info`-default env
/// filter, routed through [`RedactingMakeWriter`] when `REDACTION_ENABLED` is
/// set and straight to stdout otherwise. Shared by every daemon binary so the
/// redaction decision can't drift between them.
pub fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?);
    if redaction_enabled() {
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(RedactingMakeWriter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

pub struct RedactingStdout;

impl io::Write for RedactingStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let redacted = Redactor::redact(&String::from_utf8_lossy(buf));
        io::stdout().write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

#[derive(Clone, Default)]
pub struct RedactingMakeWriter;

impl<'a> MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingStdout;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingStdout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn redacting_writer_strips_api_keys_before_forwarding() {
        let mut writer = RedactingMakeWriter.make_writer();
        // write() redacts in place; correctness of the regex itself is
        // covered by guardrail.rs's own tests.
        let n = writer.write(b"api_key=sk-abc123\n").unwrap();
        assert_eq!(n, "api_key=sk-abc123\n".len());
    }
}
