//! Framebuffer snapshots as binary PPM (P6).

use std::io::{self, Write};
use std::path::Path;

use rfb_core::{FrameSize, Framebuffer, FramebufferSource, RfbError};

/// Write `framebuffer` as a P6 image. The alpha byte is dropped.
pub fn write_ppm<W: Write>(framebuffer: &Framebuffer, mut out: W) -> io::Result<()> {
    let size = framebuffer.size();
    write!(out, "P6\n{} {}\n255\n", size.width, size.height)?;
    let mut rgb = Vec::with_capacity(size.area() * 3);
    for px in framebuffer.data().chunks_exact(4) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    out.write_all(&rgb)?;
    out.flush()
}

/// Save the last published frame to `path`.
///
/// `frame_size` is what the caller last saw; the image always has the
/// published size. Blocks until a first frame exists.
pub fn save(source: &FramebufferSource, frame_size: FrameSize, path: &Path) -> Result<(), RfbError> {
    let framebuffer = source.grab_framebuffer_reference(frame_size)?;
    let file = std::fs::File::create(path)?;
    write_ppm(&framebuffer, io::BufWriter::new(file))?;
    tracing::info!(
        path = %path.display(),
        size = %framebuffer.size(),
        generation = framebuffer.generation(),
        "snapshot written"
    );
    Ok(())
}
