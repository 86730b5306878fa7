pub const HEALTH_ROUTE: &str = "/health";
pub const VERSION_ROUTE: &str = "/version";
pub const UPLOAD_ROUTE: &str = "/api/uploads";
pub const UPLOAD_STATUS_ROUTE: &str = "/api/uploads/status";
