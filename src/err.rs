/// A single error type for the executor core. Every error remembers which
/// stage it came from so the supervisor can tell a broken setup apart from a
/// failure while running a test program

/// Status used when the executor could not set itself up
pub const FAIL_STATUS: i32 = 67;

/// Status used when something went wrong while executing a program
pub const ERROR_STATUS: i32 = 68;

/// Status used for soft failures, the supervisor may simply retry
pub const RETRY_STATUS: i32 = 69;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Setup,     // Opening devices, mapping buffers, process init
    Execution, // Running calls and collecting coverage
    Feature,   // An optional capability, never fatal on its own
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Setup => write!(f, "setup"),
            Stage::Execution => write!(f, "execution"),
            Stage::Feature => write!(f, "feature"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecErr {
    message: String,
    stage: Stage,
}

impl ExecErr {
    pub fn setup(message: &str) -> Self {
        ExecErr {
            message: message.to_string(),
            stage: Stage::Setup,
        }
    }

    pub fn execution(message: &str) -> Self {
        ExecErr {
            message: message.to_string(),
            stage: Stage::Execution,
        }
    }

    pub fn feature(message: &str) -> Self {
        ExecErr {
            message: message.to_string(),
            stage: Stage::Feature,
        }
    }

    // Append the current errno description, most failures here come from
    // a raw libc call
    pub fn with_errno(mut self) -> Self {
        let os_err = std::io::Error::last_os_error();
        self.message = format!("{} ({})", self.message, os_err);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Process exit status a fatal error of this stage terminates with
    pub fn status(&self) -> i32 {
        match self.stage {
            Stage::Setup => FAIL_STATUS,
            Stage::Execution => ERROR_STATUS,
            Stage::Feature => RETRY_STATUS,
        }
    }

    pub fn display(&self) {
        eprintln!("[{}] {}", self.stage, self.message);
    }
}

impl std::fmt::Display for ExecErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}

impl std::error::Error for ExecErr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_map_to_distinct_statuses() {
        assert_eq!(ExecErr::setup("x").status(), FAIL_STATUS);
        assert_eq!(ExecErr::execution("x").status(), ERROR_STATUS);
        assert_eq!(ExecErr::feature("x").status(), RETRY_STATUS);
    }

    #[test]
    fn display_names_the_stage() {
        let err = ExecErr::setup("cover mmap failed");
        assert_eq!(err.to_string(), "[setup] cover mmap failed");
        assert_eq!(err.message(), "cover mmap failed");
    }
}
