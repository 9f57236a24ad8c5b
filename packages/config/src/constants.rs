// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across NeuroForge

// Admission Control
pub const SANDBOX_MAX_CONCURRENCY: &str = "SANDBOX_MAX_CONCURRENCY";
pub const SANDBOX_MAX_QUEUE: &str = "SANDBOX_MAX_QUEUE";
pub const SANDBOX_QUEUE_TIMEOUT_SECS: &str = "SANDBOX_QUEUE_TIMEOUT_SECS";
pub const SANDBOX_EVENT_CHANNEL_SIZE: &str = "SANDBOX_EVENT_CHANNEL_SIZE";

// Network Policy
pub const SANDBOX_DEFAULT_NETWORK: &str = "SANDBOX_DEFAULT_NETWORK";
pub const SANDBOX_DOCKER_NETWORK: &str = "SANDBOX_DOCKER_NETWORK"; // Runner-wide override
pub const SANDBOX_ALLOWED_NETWORKS: &str = "SANDBOX_ALLOWED_NETWORKS";

// Package Cache
pub const PIP_CACHE_DIR: &str = "PIP_CACHE_DIR";
pub const SANDBOX_CACHE_MOUNT: &str = "SANDBOX_CACHE_MOUNT";
pub const SANDBOX_BASE_PACKAGES: &str = "SANDBOX_BASE_PACKAGES";
pub const SANDBOX_INSTALL_TIMEOUT_SECS: &str = "SANDBOX_INSTALL_TIMEOUT_SECS";
pub const SANDBOX_DEPENDENCY_FAILURE_POLICY: &str = "SANDBOX_DEPENDENCY_FAILURE_POLICY";

// Container Resource Limits
pub const SANDBOX_MEMORY_LIMIT: &str = "SANDBOX_MEMORY_LIMIT";
pub const SANDBOX_CPU_LIMIT: &str = "SANDBOX_CPU_LIMIT";
pub const SANDBOX_PIDS_LIMIT: &str = "SANDBOX_PIDS_LIMIT";
pub const SANDBOX_TMPFS_SIZE: &str = "SANDBOX_TMPFS_SIZE";

// Execution Timeouts
pub const SANDBOX_DEFAULT_TIMEOUT_SECS: &str = "SANDBOX_DEFAULT_TIMEOUT_SECS";
pub const LOCAL_RUN_TIMEOUT: &str = "LOCAL_RUN_TIMEOUT"; // Legacy
pub const SANDBOX_MAX_TIMEOUT_SECS: &str = "SANDBOX_MAX_TIMEOUT_SECS";

// Code Screening
pub const SANDBOX_SCREEN_CODE: &str = "SANDBOX_SCREEN_CODE";

// Language Images
pub const SANDBOX_IMAGE_PYTHON: &str = "SANDBOX_IMAGE_PYTHON";
pub const SANDBOX_IMAGE_NODE: &str = "SANDBOX_IMAGE_NODE";
pub const SANDBOX_IMAGE_C: &str = "SANDBOX_IMAGE_C";
pub const SANDBOX_IMAGE_CPP: &str = "SANDBOX_IMAGE_CPP";
pub const SANDBOX_IMAGE_JAVA: &str = "SANDBOX_IMAGE_JAVA";

// Tool Memory
pub const MEMORY_DB_PATH: &str = "MEMORY_DB_PATH";
pub const MEMORY_FAILURE_THRESHOLD: &str = "MEMORY_FAILURE_THRESHOLD";
pub const MEMORY_TRACE_THRESHOLD: &str = "MEMORY_TRACE_THRESHOLD";
pub const MEMORY_EXCLUDE_FAILING: &str = "MEMORY_EXCLUDE_FAILING";
