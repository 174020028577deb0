//! askpass-relay: fallback passphrase helper for the stub-relay trials.
//!
//! Speaks the askpass convention: invoked with the prompt as its argument,
//! prints the secret on stdout. Stands in for the embedding application's
//! relay when the primary pinentry path is broken. Invocations land in
//! `$LOG_DIR/askpass.log`.

use std::io::Write;
use std::path::PathBuf;

use gpgmatrix_pinentry::SECRET;

fn main() {
    if let Ok(log_dir) = std::env::var("LOG_DIR") {
        let prompt: Vec<String> = std::env::args().skip(1).collect();
        let line = format!(
            "{} askpass relay invoked: {}\n",
            chrono::Utc::now().to_rfc3339(),
            prompt.join(" ")
        );
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(PathBuf::from(log_dir).join("askpass.log"))
        {
            file.write_all(line.as_bytes()).ok();
        }
    }

    println!("{SECRET}");
}
