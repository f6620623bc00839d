use clap::Args;

/// Logging overrides that can be set via CLI or env vars
#[derive(Debug, Clone, Default, Args)]
pub struct LoggingArgs {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "SCANSERVE_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log filter directives
    #[arg(long = "log-filter", env = "SCANSERVE_LOG_FILTER", global = true)]
    pub log_filter: Option<String>,
}

impl LoggingArgs {
    /// Level from `-v` flags, then `--log-level`, then `configured`
    pub fn get_effective_level<'a>(&'a self, configured: &'a str) -> &'a str {
        match (self.verbose, self.log_level.as_deref()) {
            (v, _) if v >= 2 => "trace",
            (1, _) => "debug",
            (0, Some(level)) => level,
            _ => configured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_level() {
        let mut args = LoggingArgs::default();
        assert_eq!(args.get_effective_level("warn"), "warn");
        args.log_level = Some("error".into());
        assert_eq!(args.get_effective_level("warn"), "error");
        args.verbose = 1;
        assert_eq!(args.get_effective_level("warn"), "debug");
        args.verbose = 3;
        assert_eq!(args.get_effective_level("warn"), "trace");
    }
}
