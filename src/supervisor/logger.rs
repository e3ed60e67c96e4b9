//! Per-unit log output.

use std::path::Path;

/// Logs on behalf of one unit, tagged with the module file name.
/// A quiet unit only reports errors.
#[derive(Debug, Clone)]
pub struct UnitLogger {
    module: String,
    quiet: bool,
}

impl UnitLogger {
    pub fn new(path: &Path, quiet: bool) -> Self {
        let module = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { module, quiet }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            tracing::info!(module = %self.module, "{}", message);
        }
    }

    pub fn error(&self, message: &str) {
        tracing::error!(module = %self.module, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_name_is_file_name() {
        let logger = UnitLogger::new(Path::new("/srv/app/handler.js"), true);
        assert_eq!(logger.module(), "handler.js");
    }
}
