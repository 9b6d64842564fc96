/// Application name, used for data directories and marker files.
pub const APP_NAME: &str = "keg";

/// Length of the truncated fingerprint used in install paths.
pub const FINGERPRINT_LEN: usize = 20;

/// Marker file written into an install prefix once its build completed.
pub const COMPLETE_MARKER: &str = ".keg-complete";

/// Environment variable overriding the store location.
pub const STORE_ENV: &str = "KEG_STORE";

/// Environment variable overriding the catalog location.
pub const CATALOG_ENV: &str = "KEG_CATALOG";

/// Default catalog file name, looked up in the current directory.
pub const DEFAULT_CATALOG: &str = "formulas.lua";

/// Value of `SOURCE_DATE_EPOCH` in the base environment (1980-01-01, the ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";
