// Exit codes for CLI automation
pub const SUCCESS: i32 = 0;
pub const ERROR: i32 = 1;
pub const NOT_FOUND: i32 = 2;
pub const INVALID_INPUT: i32 = 3;
/// Operation finished but at least one job ended in error
pub const JOB_ERRORS: i32 = 4;
/// Operation stopped by Ctrl+C
pub const INTERRUPTED: i32 = 130;
