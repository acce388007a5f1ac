use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";
/// The file sink keeps ONNX Runtime warnings the console hides.
pub const DEFAULT_FILE_NOISE_FILTER: &str = "ort=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "waifu2x";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub file_noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            file_noise_filter: DEFAULT_FILE_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub retention_files: usize,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub retention_files: usize,
    pub reason: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn retention_files(&self) -> usize {
        match self {
            Self::Ready(plan) => plan.retention_files,
            Self::Fallback(plan) => plan.retention_files,
        }
    }

    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready(plan) => Some(plan.log_dir.as_path()),
            Self::Fallback(plan) => plan.attempted_log_dir.as_deref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Daily rolling log file under `<data_dir>/logs`, or the reason it could
/// not be set up. A fallback plan means console-only logging.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = normalize_retention_files(options.retention_files);

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            retention_files,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match appender {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan {
            log_dir,
            retention_files,
            appender,
        }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            retention_files,
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

/// Filter precedence: `--log-filter` > `-vv`/`-v` > `RUST_LOG` > default.
/// The noise filter is only prepended when the user did not pick a filter.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let include_noise = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;

    let console_filter = merge_noise_filter(&options.noise_filter, &user_filter, include_noise);
    let file_filter = merge_noise_filter(&options.file_noise_filter, &user_filter, include_noise);

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn normalize_retention_files(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise_filter: bool) -> String {
    if include_noise_filter && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingInitOptions {
            verbose: 2,
            cli_log_filter: Some("waifu2x_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "waifu2x_core=trace");
        assert_eq!(filters.console_filter, "waifu2x_core=trace");
        assert_eq!(filters.file_filter, "waifu2x_core=trace");
    }

    #[test]
    fn verbose_levels_map_to_debug_and_trace() {
        let one = LoggingInitOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let two = LoggingInitOptions {
            verbose: 2,
            ..one.clone()
        };

        assert_eq!(compose_logging_filters(&one).console_filter, "debug");
        assert_eq!(compose_logging_filters(&two).console_filter, "trace");
    }

    #[test]
    fn rust_log_env_used_when_no_cli_or_verbose() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn,waifu2x_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_logging_filters(&options);
        assert_eq!(filters.user_filter, "warn,waifu2x_core=debug");
        assert_eq!(filters.console_filter, "ort=error,warn,waifu2x_core=debug");
    }

    #[test]
    fn noise_filter_differs_between_console_and_file() {
        let filters = compose_logging_filters(&LoggingInitOptions::default());
        assert_eq!(filters.console_filter, "ort=error,info");
        assert_eq!(filters.file_filter, "ort=warn,info");
    }

    #[test]
    fn noise_filter_can_be_disabled() {
        let options = LoggingInitOptions {
            include_noise_filter_when_implicit: false,
            ..Default::default()
        };
        assert_eq!(compose_logging_filters(&options).console_filter, "info");
    }

    #[test]
    fn file_sink_without_data_dir_falls_back() {
        let plan = build_file_sink_plan(&LoggingInitOptions::default());
        assert!(!plan.is_ready());
        assert!(plan.log_dir().is_none());
        assert!(plan.fallback_reason().unwrap().contains("data_dir"));
    }

    #[test]
    fn file_sink_creates_log_dir() {
        let temp = tempdir().unwrap();
        let options = LoggingInitOptions {
            data_dir: Some(temp.path().to_path_buf()),
            retention_files: 0,
            ..Default::default()
        };

        let plan = build_file_sink_plan(&options);
        assert!(plan.is_ready(), "{:?}", plan.fallback_reason());
        assert_eq!(plan.retention_files(), DEFAULT_LOG_RETENTION_FILES);
        assert_eq!(plan.log_dir(), Some(temp.path().join("logs").as_path()));
        assert!(temp.path().join("logs").is_dir());
    }

    #[test]
    fn file_sink_reports_unusable_data_dir() {
        let file = NamedTempFile::new().unwrap();
        let options = LoggingInitOptions {
            data_dir: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let plan = compose_logging_init_plan(&options).file_sink;
        assert!(!plan.is_ready());
        assert!(plan
            .fallback_reason()
            .unwrap()
            .contains("failed to create log directory"));
    }
}
