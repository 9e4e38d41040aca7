/// Command-line style overrides applied on top of file and environment configuration.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Extra configuration file, loaded last.
    pub cfg_name: Option<String>,
    pub server_name: Option<String>,
    pub server_uid: Option<String>,
    pub export_dir: Option<String>,
    pub import_dir: Option<String>,
    pub max_active_requests: Option<usize>,
}
