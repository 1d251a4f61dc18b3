//! Startup banner utilities.

use crate::config::{Config, format_size};
use std::fmt::Write;

/// Configuration for the startup banner.
pub struct BannerConfig<'a> {
    /// Version string
    pub version: &'a str,
    pub config: &'a Config,
}

/// Print a startup banner to stdout.
pub fn print_banner(banner: &BannerConfig) {
    print!("{}", render(banner));
}

fn render(banner: &BannerConfig) -> String {
    let config = banner.config;
    let mut output = String::with_capacity(512);

    let name = "cachedump";
    let _ = writeln!(output, "{} v{}", name, banner.version);
    let _ = writeln!(output, "{}", "=".repeat(name.len() + banner.version.len() + 2));
    let _ = writeln!(output);

    let _ = writeln!(output, "Server:      {}", config.server_address());
    let _ = writeln!(output, "Workers:     {}", config.workers.threads);
    let _ = writeln!(
        output,
        "Mode:        {}",
        if config.dump.resume { "resume" } else { "fresh" }
    );
    let _ = writeln!(output, "Request ID:  {}", config.dump.req_id);
    let _ = writeln!(output);

    let _ = writeln!(output, "Memory:");
    let _ = writeln!(output, "  Chunk:     {}", format_size(config.memory.chunk_size));
    let _ = writeln!(output, "  Limit:     {}", format_size(config.memory.limit));
    let _ = writeln!(output, "  Chunks:    {}", config.chunk_count());
    let _ = writeln!(output);

    let _ = writeln!(output, "Output:");
    let _ = writeln!(output, "  Directory: {}", config.output.dir.display());
    let _ = writeln!(output, "  Key files: {}", format_size(config.output.key_file_size));
    let _ = writeln!(output, "  Data files: {}", format_size(config.output.data_file_size));
    let _ = writeln!(
        output,
        "  Checksum:  {}",
        if config.output.checksum { "md5" } else { "off" }
    );
    let _ = writeln!(output);

    let _ = writeln!(output, "Dump:");
    let _ = writeln!(output, "  Bulk get:  {} keys", config.dump.bulk_get_threshold);
    let _ = writeln!(
        output,
        "  Skip keys expiring within {}s",
        config.dump.only_expire_after_secs
    );
    if config.filter.is_enabled() {
        let _ = writeln!(
            output,
            "  Filter:    {} of {} instances",
            config.filter.dest_ips.len(),
            config.filter.all_ips.len()
        );
    }
    if config.upload.enabled {
        let _ = writeln!(
            output,
            "  Upload:    {}/{}",
            config.upload.bucket,
            config.upload.path.trim_matches('/')
        );
    }
    let _ = writeln!(output);

    output
}
