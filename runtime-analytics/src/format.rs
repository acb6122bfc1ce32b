//! Line formats a bucket's writer serializes records into. One record per
//! line either way; only the envelope differs between upload targets.

use std::io::{self, Write};

use crate::record::Record;

pub trait LineFormat: Send + Sync {
    fn write_record(&self, record: &Record, out: &mut dyn Write) -> io::Result<()>;

    /// Extension used for the staged file, matching the filesystem layout.
    fn file_extension(&self) -> &'static str;

    fn uses_gzip(&self) -> bool;
}

fn to_io_err(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// SaaS/GCP legacy upload: gzip of newline-delimited JSON records.
pub struct SaasFormat;

impl LineFormat for SaasFormat {
    fn write_record(&self, record: &Record, out: &mut dyn Write) -> io::Result<()> {
        let line = serde_json::to_string(&record.to_json()).map_err(to_io_err)?;
        writeln!(out, "{line}")
    }

    fn file_extension(&self) -> &'static str {
        "gz"
    }

    fn uses_gzip(&self) -> bool {
        true
    }
}

/// fluentd forward-over-TCP framing: `["<tag>", <unix-seconds>, <record>]`
/// per line, staged uncompressed. The tag embeds org/env/client per
/// record, so it can't be a fixed field the way the SaaS format has none.
pub struct FluentdFormat;

impl LineFormat for FluentdFormat {
    fn write_record(&self, record: &Record, out: &mut dyn Write) -> io::Result<()> {
        let tag = format!(
            "api.{}.{}.{}",
            record.organization,
            record.environment,
            record.client_id.as_deref().unwrap_or("unknown"),
        );
        let envelope = serde_json::json!([
            tag,
            record.client_received_end.timestamp(),
            record.to_json(),
        ]);
        let line = serde_json::to_string(&envelope).map_err(to_io_err)?;
        writeln!(out, "{line}")
    }

    fn file_extension(&self) -> &'static str {
        "txt"
    }

    fn uses_gzip(&self) -> bool {
        false
    }
}
