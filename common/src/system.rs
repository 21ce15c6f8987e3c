use tracing::error;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Required executable not found in PATH")]
    ExecutableNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks if an executable can be resolved through the PATH environment
/// variable, using the platform lookup tool (`which` on Unix, `where` on
/// Windows).
///
/// # Arguments
///
/// * `executable` - The name of the executable to search for
///
/// # Returns
///
/// * `Ok(())` if the executable is found in PATH
/// * `Err(Error::ExecutableNotFound)` otherwise
pub fn which<S>(executable: S) -> Result<()>
where
    S: AsRef<str>,
{
    let executable = executable.as_ref();
    let which_cmd = if cfg!(windows) { "where" } else { "which" };
    if !std::process::Command::new(which_cmd)
        .arg(executable)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
    {
        error!("{executable:#?} executable not found in PATH");
        return Err(Error::ExecutableNotFound);
    }
    Ok(())
}
