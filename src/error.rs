/// Turns a fallible result into an `Option`, logging the error instead of propagating it.
///
/// Used on paths where partial data is preferred over failing the caller, e.g. a single
/// container whose network namespace vanished mid-scan.
pub trait ResultOkLogExt<T, E> {
    /// Logs the error at `error` level.
    fn ok_log(self) -> Option<T>;

    /// Logs the error at `debug` level. For expected, transient failures.
    fn ok_debug(self) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }

    fn ok_debug(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::debug!("{err}");
                None
            }
        }
    }
}
