/// Opens a URL in the user's browser.
///
/// Fire-and-forget: the interactive flow does not wait on the browser, only
/// on the redirect it eventually produces.
pub trait BrowserLauncher: Send + Sync {
    /// # Errors
    ///
    /// Returns a description of why the browser could not be started. The
    /// message must not contain the URL.
    fn open_external(&self, url: &str) -> Result<(), String>;
}
