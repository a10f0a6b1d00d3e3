// Animation scripts
//
// A script maps an elapsed time and a window context to a vector of
// named numeric outputs. The engine in `anim` doesn't care where
// the numbers come from, it drives anything implementing
// `AnimScript`. The built-in implementation is a small keyframe
// program compiled from a one-line-per-output text form.
//
// Austin Shafer - 2024
use super::TriggerMask;
use utils::anyhow;
use utils::region::Rect;
use utils::Result;

/// The named outputs a script can produce
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(usize)]
pub enum OutputKind {
    Opacity = 0,
    BlurOpacity,
    ShadowOpacity,
    OffsetX,
    OffsetY,
    ScaleX,
    ScaleY,
    ShadowOffsetX,
    ShadowOffsetY,
    ShadowScaleX,
    ShadowScaleY,
    CropX,
    CropY,
    CropWidth,
    CropHeight,
}

pub const NUM_OUTPUTS: usize = 15;

impl OutputKind {
    pub fn all() -> &'static [OutputKind] {
        use OutputKind::*;
        &[
            Opacity,
            BlurOpacity,
            ShadowOpacity,
            OffsetX,
            OffsetY,
            ScaleX,
            ScaleY,
            ShadowOffsetX,
            ShadowOffsetY,
            ShadowScaleX,
            ShadowScaleY,
            CropX,
            CropY,
            CropWidth,
            CropHeight,
        ]
    }

    fn from_name(name: &str) -> Option<OutputKind> {
        use OutputKind::*;
        Some(match name {
            "opacity" => Opacity,
            "blur-opacity" => BlurOpacity,
            "shadow-opacity" => ShadowOpacity,
            "offset-x" => OffsetX,
            "offset-y" => OffsetY,
            "scale-x" => ScaleX,
            "scale-y" => ScaleY,
            "shadow-offset-x" => ShadowOffsetX,
            "shadow-offset-y" => ShadowOffsetY,
            "shadow-scale-x" => ShadowScaleX,
            "shadow-scale-y" => ShadowScaleY,
            "crop-x" => CropX,
            "crop-y" => CropY,
            "crop-width" => CropWidth,
            "crop-height" => CropHeight,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// Which outputs a script actually produced
    pub struct OutputMask: u32 {
        const OPACITY         = 1 << 0;
        const BLUR_OPACITY    = 1 << 1;
        const SHADOW_OPACITY  = 1 << 2;
        const OFFSET_X        = 1 << 3;
        const OFFSET_Y        = 1 << 4;
        const SCALE_X         = 1 << 5;
        const SCALE_Y         = 1 << 6;
        const SHADOW_OFFSET_X = 1 << 7;
        const SHADOW_OFFSET_Y = 1 << 8;
        const SHADOW_SCALE_X  = 1 << 9;
        const SHADOW_SCALE_Y  = 1 << 10;
        const CROP_X          = 1 << 11;
        const CROP_Y          = 1 << 12;
        const CROP_WIDTH      = 1 << 13;
        const CROP_HEIGHT     = 1 << 14;
    }
}

impl OutputMask {
    pub fn for_kind(kind: OutputKind) -> OutputMask {
        OutputMask::from_bits_truncate(1 << (kind as usize))
    }
}

/// A full vector of output values plus which of them were produced
/// by the script (the rest hold defaults).
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AnimOutputs {
    pub ao_mask: OutputMask,
    ao_vals: [f64; NUM_OUTPUTS],
}

impl AnimOutputs {
    /// The default output vector for a window
    ///
    /// Unproduced outputs fall back to: opacity → the computed
    /// target, crop dimensions → +inf, scales → 1, offsets and crop
    /// origin → 0, blur opacity → 1 when mapped else 0. The shadow
    /// opacity tracks the resolved window opacity.
    pub fn defaults(mapped: bool, opacity_target: f64) -> AnimOutputs {
        let mut ret = AnimOutputs {
            ao_mask: OutputMask::empty(),
            ao_vals: [0.0; NUM_OUTPUTS],
        };
        ret.ao_vals[OutputKind::Opacity as usize] = opacity_target;
        ret.ao_vals[OutputKind::BlurOpacity as usize] = if mapped { 1.0 } else { 0.0 };
        ret.ao_vals[OutputKind::ShadowOpacity as usize] = opacity_target;
        ret.ao_vals[OutputKind::ScaleX as usize] = 1.0;
        ret.ao_vals[OutputKind::ScaleY as usize] = 1.0;
        ret.ao_vals[OutputKind::ShadowScaleX as usize] = 1.0;
        ret.ao_vals[OutputKind::ShadowScaleY as usize] = 1.0;
        ret.ao_vals[OutputKind::CropWidth as usize] = f64::INFINITY;
        ret.ao_vals[OutputKind::CropHeight as usize] = f64::INFINITY;
        return ret;
    }

    pub fn get(&self, kind: OutputKind) -> f64 {
        self.ao_vals[kind as usize]
    }

    pub fn set(&mut self, kind: OutputKind, val: f64) {
        self.ao_mask |= OutputMask::for_kind(kind);
        self.ao_vals[kind as usize] = val;
    }

    pub fn was_produced(&self, kind: OutputKind) -> bool {
        self.ao_mask.contains(OutputMask::for_kind(kind))
    }

    /// Overlay the produced outputs of `other` onto this vector
    pub fn merge_produced(&mut self, other: &AnimOutputs) {
        for kind in OutputKind::all().iter() {
            if other.was_produced(*kind) {
                self.set(*kind, other.get(*kind));
            }
        }
    }
}

/// The evaluation context handed to a script
///
/// Scripts interpolate between values that can reference the
/// window's current geometry, its monitor, and the opacity targets
/// on either side of the transition.
#[derive(Debug, Copy, Clone)]
pub struct AnimContext {
    pub ctx_geom: Rect<i32>,
    pub ctx_monitor: Rect<i32>,
    /// the opacity the window is heading towards
    pub ctx_opacity_target: f64,
    /// the opacity target before this transition
    pub ctx_opacity_before: f64,
}

/// A live evaluator for one animation script
///
/// This is the animation-runtime interface the engine consumes:
/// advance time, evaluate against a context and a resume base, and
/// report completion. The elapsed time and per-output memory live
/// in `anim::AnimInstance`, not here, so one script can drive many
/// windows.
pub trait AnimScript {
    /// Total running time in seconds
    fn duration(&self) -> f64;
    /// The outputs this script produces
    fn outputs(&self) -> OutputMask;
    /// Triggers that must not restart the animation while it runs
    fn suppressions(&self) -> TriggerMask;
    /// Evaluate at `elapsed` seconds. `start` holds the per-output
    /// values the animation began from (the resume base).
    fn evaluate(&self, elapsed: f64, ctx: &AnimContext, start: &AnimOutputs)
        -> Result<AnimOutputs>;
}

/// Interpolation curves
///
/// The eased variants are the usual cubic hermite shapes.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Curve {
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
}

impl Curve {
    /// Map linear progress t in [0, 1] onto the curve
    pub fn apply(&self, t: f64) -> f64 {
        let t = utils::partial_clamp(t, 0.0, 1.0);
        match self {
            Curve::Linear => t,
            Curve::EaseIn => t * t,
            Curve::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            // smoothstep: 3t^2 - 2t^3
            Curve::EaseInOut => t * t * (3.0 - 2.0 * t),
        }
    }

    fn from_name(name: &str) -> Option<Curve> {
        Some(match name {
            "linear" => Curve::Linear,
            "ease-in" => Curve::EaseIn,
            "ease-out" => Curve::EaseOut,
            "ease-in-out" => Curve::EaseInOut,
            _ => return None,
        })
    }
}

/// Where a channel endpoint gets its value from
#[derive(Debug, Copy, Clone, PartialEq)]
enum ChannelValue {
    Literal(f64),
    /// the output's value at the moment the animation started,
    /// which is what makes resume-from seamless
    Current,
    /// the computed opacity target
    Target,
    /// the opacity target before the transition
    Before,
}

impl ChannelValue {
    fn parse(tok: &str) -> Result<ChannelValue> {
        Ok(match tok {
            "current" => ChannelValue::Current,
            "target" => ChannelValue::Target,
            "before" => ChannelValue::Before,
            lit => ChannelValue::Literal(
                lit.parse::<f64>()
                    .map_err(|_| anyhow!("invalid channel value {:?}", lit))?,
            ),
        })
    }

    fn resolve(&self, kind: OutputKind, ctx: &AnimContext, start: &AnimOutputs) -> f64 {
        match self {
            ChannelValue::Literal(v) => *v,
            ChannelValue::Current => start.get(kind),
            ChannelValue::Target => ctx.ctx_opacity_target,
            ChannelValue::Before => ctx.ctx_opacity_before,
        }
    }
}

/// One animated output channel
#[derive(Debug, Copy, Clone)]
struct Channel {
    kc_output: OutputKind,
    kc_from: ChannelValue,
    kc_to: ChannelValue,
    /// seconds
    kc_duration: f64,
    kc_curve: Curve,
}

/// The built-in keyframe script
///
/// Compiled from a declarative text form, one channel per line:
///
/// ```text
/// # open: fade in and slide up
/// suppress open show
/// opacity current target 200 ease-out
/// offset-y 30 0 200 ease-out
/// ```
///
/// Each channel line reads `<output> <from> <to> <duration-ms>
/// <curve>`, where `<from>`/`<to>` are numbers or one of `current`,
/// `target`, `before`.
#[derive(Debug, Clone)]
pub struct KeyframeScript {
    ks_channels: Vec<Channel>,
    ks_duration: f64,
    ks_suppressions: TriggerMask,
}

impl KeyframeScript {
    pub fn parse(text: &str) -> Result<KeyframeScript> {
        let mut channels = Vec::new();
        let mut suppressions = TriggerMask::empty();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let toks: Vec<&str> = line.split_whitespace().collect();

            if toks[0] == "suppress" {
                for name in toks.iter().skip(1) {
                    suppressions |= TriggerMask::from_name(name)
                        .ok_or(anyhow!("unknown trigger {:?}", name))?;
                }
                continue;
            }

            if toks.len() != 5 {
                return Err(anyhow!("malformed channel line {:?}", line));
            }
            let output = OutputKind::from_name(toks[0])
                .ok_or(anyhow!("unknown output {:?}", toks[0]))?;
            let from = ChannelValue::parse(toks[1])?;
            let to = ChannelValue::parse(toks[2])?;
            let duration_ms = toks[3]
                .parse::<f64>()
                .map_err(|_| anyhow!("invalid duration {:?}", toks[3]))?;
            let curve =
                Curve::from_name(toks[4]).ok_or(anyhow!("unknown curve {:?}", toks[4]))?;

            channels.push(Channel {
                kc_output: output,
                kc_from: from,
                kc_to: to,
                kc_duration: duration_ms / 1000.0,
                kc_curve: curve,
            });
        }

        if channels.is_empty() {
            return Err(anyhow!("script produces no outputs"));
        }

        let duration = channels
            .iter()
            .fold(0.0_f64, |acc, c| utils::partial_max(acc, c.kc_duration));

        Ok(KeyframeScript {
            ks_channels: channels,
            ks_duration: duration,
            ks_suppressions: suppressions,
        })
    }
}

impl AnimScript for KeyframeScript {
    fn duration(&self) -> f64 {
        self.ks_duration
    }

    fn outputs(&self) -> OutputMask {
        self.ks_channels
            .iter()
            .fold(OutputMask::empty(), |acc, c| {
                acc | OutputMask::for_kind(c.kc_output)
            })
    }

    fn suppressions(&self) -> TriggerMask {
        self.ks_suppressions
    }

    fn evaluate(
        &self,
        elapsed: f64,
        ctx: &AnimContext,
        start: &AnimOutputs,
    ) -> Result<AnimOutputs> {
        let mut ret = AnimOutputs::defaults(true, ctx.ctx_opacity_target);
        ret.ao_mask = OutputMask::empty();

        for chan in self.ks_channels.iter() {
            let from = chan.kc_from.resolve(chan.kc_output, ctx, start);
            let to = chan.kc_to.resolve(chan.kc_output, ctx, start);
            let t = if chan.kc_duration <= 0.0 {
                1.0
            } else {
                elapsed / chan.kc_duration
            };
            let progress = chan.kc_curve.apply(t);
            ret.set(chan.kc_output, from + (to - from) * progress);
        }
        return Ok(ret);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> AnimContext {
        AnimContext {
            ctx_geom: Rect::new(0, 0, 100, 100),
            ctx_monitor: Rect::new(0, 0, 1920, 1080),
            ctx_opacity_target: 0.8,
            ctx_opacity_before: 0.0,
        }
    }

    #[test]
    fn parse_and_evaluate_linear() {
        let script = KeyframeScript::parse("opacity 0 target 200 linear").unwrap();
        assert_eq!(script.duration(), 0.2);
        assert!(script.outputs().contains(OutputMask::OPACITY));

        let start = AnimOutputs::defaults(true, 0.8);
        let half = script.evaluate(0.1, &test_ctx(), &start).unwrap();
        assert!((half.get(OutputKind::Opacity) - 0.4).abs() < 1e-9);

        let done = script.evaluate(0.25, &test_ctx(), &start).unwrap();
        assert!((done.get(OutputKind::Opacity) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn resume_base_feeds_current() {
        let script = KeyframeScript::parse("opacity current target 100 linear").unwrap();
        let mut start = AnimOutputs::defaults(true, 0.8);
        start.set(OutputKind::Opacity, 0.53);

        let begin = script.evaluate(0.0, &test_ctx(), &start).unwrap();
        assert!((begin.get(OutputKind::Opacity) - 0.53).abs() < 1e-9);
    }

    #[test]
    fn suppress_directive() {
        let script =
            KeyframeScript::parse("suppress open show\nopacity 0 1 100 ease-in-out").unwrap();
        assert!(script.suppressions().contains(TriggerMask::OPEN));
        assert!(script.suppressions().contains(TriggerMask::SHOW));
        assert!(!script.suppressions().contains(TriggerMask::CLOSE));
    }

    #[test]
    fn rejects_garbage() {
        assert!(KeyframeScript::parse("").is_err());
        assert!(KeyframeScript::parse("opacity 0 1 100").is_err());
        assert!(KeyframeScript::parse("wobble 0 1 100 linear").is_err());
    }
}
