//! Basic multiplexer round trip
//!
//! Writes a pattern through the service, reads it back asynchronously,
//! and verifies the contents.

use fmux::{AsyncFile, IoService, OpenMode, Result};
use std::cell::Cell;
use std::rc::Rc;

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("fmux=debug")
        .init();

    let dir = std::env::temp_dir();
    let path = dir.join("fmux-basic-read.bin");

    let service = IoService::new()?;
    let file = AsyncFile::open(&service, &path, OpenMode::CreateTruncate)?;
    println!("Opened {}", file.path().display());

    let pattern: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    let done = Rc::new(Cell::new(false));

    let seen = done.clone();
    file.begin_write(0, vec![pattern.clone()], move |outcome| {
        let transfer = outcome.expect("write failed");
        println!("Wrote {} bytes", transfer.total());
        seen.set(true);
    })?;
    while !done.get() {
        service.run()?;
    }

    done.set(false);
    let seen = done.clone();
    file.begin_read(0, vec![vec![0u8; 4096]], move |outcome| {
        let transfer = outcome.expect("read failed");
        println!("Read {} bytes back", transfer.total());
        assert_eq!(transfer.buffers[0], pattern);
        seen.set(true);
    })?;
    while !done.get() {
        service.run()?;
    }

    println!("Round trip verified, removing {}", path.display());
    std::fs::remove_file(&path).ok();
    Ok(())
}
