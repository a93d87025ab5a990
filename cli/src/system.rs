//! Desktop implementations of the broker's collaborators.

use broker::auth::{BrowserLauncher, DeviceCodeCallback, DeviceCodeInfo};
use std::sync::Arc;

/// Opens URLs with the platform's default browser.
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open_external(&self, url: &str) -> Result<(), String> {
        // The io::Error text can echo the launcher command line, URL included.
        open::that_detached(url).map_err(|e| format!("browser launch failed ({})", e.kind()))
    }
}

/// Prints device code instructions to stderr.
pub fn print_device_code() -> DeviceCodeCallback {
    Arc::new(|info: &DeviceCodeInfo| {
        eprintln!();
        eprintln!("{}", info.message);
        eprintln!();
    })
}
