// GPU backend abstraction
//
// The compositor core owns the lifecycle of per-window images but
// never touches pixels. Binding pixmaps, shadow/mask generation,
// shader compilation and presentation all happen behind this trait.
//
// Austin Shafer - 2024
use crate::server::Pixmap;
use utils::region::{Rect, Region};
use utils::Result;

/// An opaque handle to a GPU-side image owned by the backend
///
/// The core tracks which record holds which handle and guarantees
/// release-before-free, the backend owns the actual storage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BackendImage(pub u64);

/// An opaque handle to a compiled foreground shader
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub u64);

/// Health of the rendering device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    /// The device was lost. The core sleeps briefly and then asks
    /// the outer loop for a full session reset.
    ResetRequired,
}

/// Per-image paint parameters the core pushes down before present
#[derive(Debug, Copy, Clone)]
pub enum ImageProperty {
    Opacity(f64),
    InvertColor(bool),
    CornerRadius(f64),
    FgShader(Option<ShaderHandle>),
}

/// One draw command in a frame
///
/// Commands are emitted bottom-to-top, the order is authoritative
/// for painting.
#[derive(Debug, Clone)]
pub struct DrawCmd {
    pub dc_image: BackendImage,
    /// destination rectangle after animation offset/scale
    pub dc_rect: Rect<i32>,
    pub dc_opacity: f64,
    pub dc_blur_behind: bool,
    pub dc_blur_opacity: f64,
    /// crop rectangle in destination space
    pub dc_crop: Rect<i32>,
    /// optional shadow drawn underneath this command
    pub dc_shadow: Option<ShadowCmd>,
}

/// Shadow parameters attached to a draw command
#[derive(Debug, Clone)]
pub struct ShadowCmd {
    pub sc_image: BackendImage,
    pub sc_rect: Rect<i32>,
    pub sc_opacity: f64,
    /// region above the window that clips the shadow out
    pub sc_clip: Region,
}

/// A fully assembled frame, handed to `Backend::present`
#[derive(Debug, Clone)]
pub struct Frame {
    pub f_cmds: Vec<DrawCmd>,
    /// accumulated damage for the target buffer age
    pub f_damage: Region,
}

/// The GPU-facing component that turns per-window rendering
/// commands into display output.
///
/// Implementations are expected to run asynchronously: `present`
/// queues GPU work and returns, `last_render_time` reports when that
/// work actually finished so the frame scheduler can collect timing
/// statistics.
pub trait Backend {
    /// Bind a named pixmap into a GPU image
    fn bind_pixmap(&mut self, pixmap: Pixmap) -> Result<BackendImage>;
    /// Release an image. The underlying pixmap is not freed, that
    /// is the caller's job.
    fn release_image(&mut self, image: BackendImage);
    /// Snapshot `region` of an existing image into a new one, used
    /// for cross-fades on resize and unmap
    fn clone_image(&mut self, image: BackendImage, region: &Region) -> Result<BackendImage>;
    /// Build a 1-bit coverage mask of `region` at `size`
    fn make_mask(&mut self, size: (u32, u32), region: &Region) -> Result<BackendImage>;
    /// Rasterize a shadow image for a window of `size`
    fn render_shadow(
        &mut self,
        size: (u32, u32),
        radius: i32,
        color: (f64, f64, f64, f64),
    ) -> Result<BackendImage>;
    fn create_shader(&mut self, source: &str) -> Result<ShaderHandle>;
    fn set_image_property(&mut self, image: BackendImage, prop: ImageProperty) -> Result<()>;

    /// Duration of the last completed render in microseconds, or
    /// None while the GPU is still chewing on it
    fn last_render_time(&mut self) -> Option<u64>;
    /// How many old buffers the backend keeps, bounds the damage
    /// ring depth
    fn max_buffer_age(&self) -> usize;
    /// The root changed size/format, drop derived state
    fn root_change(&mut self);
    fn device_status(&mut self) -> DeviceStatus;

    /// Queue the frame for presentation
    fn present(&mut self, frame: &Frame) -> Result<()>;
}
