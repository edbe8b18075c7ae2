//! Boosted Haar cascade loaded from OpenCV's XML storage format.
//!
//! Understands the format written by `opencv_traincascade` and shipped in
//! `haarcascades/` since OpenCV 2.4 (`<cascade>` root, `BOOST` stages,
//! `HAAR` features). Upright features only; stump and tree weak
//! classifiers are both handled.

use image::GrayImage;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade XML error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed cascade: {0}")]
    Malformed(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
}

/// One weighted rectangle of a Haar feature, relative to the window origin.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone, Default)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
    tilted: bool,
}

impl HaarFeature {
    fn evaluate(&self, ii: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight as f64 * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

/// Split node of a weak classifier. `left`/`right` > 0 index another node,
/// <= 0 index a leaf as `-value`.
#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone, Default)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

/// A loaded Haar cascade.
#[derive(Debug, Clone)]
pub struct Cascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl Cascade {
    /// Load a cascade XML file (e.g. `haarcascade_frontalface_default.xml`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;

        tracing::info!(
            path = %path.display(),
            window = ?cascade.window_size(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );

        Ok(cascade)
    }

    /// Parse a cascade from its XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        parse_cascade(xml)?.build()
    }

    /// Training window size (width, height) of the cascade.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage on the window whose top-left corner is `(x, y)`.
    ///
    /// The caller guarantees the window lies inside the integral image.
    pub(crate) fn passes(&self, ii: &IntegralImage, x: u32, y: u32) -> bool {
        // Variance normalization over the window shrunk by one pixel per side.
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = ii.sum(x + 1, y + 1, nw, nh) as f64;
        let sqsum = ii.sqsum(x + 1, y + 1, nw, nh) as f64;
        let nf = area * sqsum - sum * sum;
        let nf = if nf > 0.0 { nf.sqrt() } else { 1.0 };
        let inv_norm = 1.0 / nf;

        for stage in &self.stages {
            let mut stage_sum = 0.0f64;
            for weak in &stage.classifiers {
                let mut idx = 0i32;
                let leaf = loop {
                    let node = &weak.nodes[idx as usize];
                    let value = self.features[node.feature].evaluate(ii, x, y) * inv_norm;
                    idx = if value < node.threshold as f64 {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        break weak.leaves[(-idx) as usize];
                    }
                };
                stage_sum += leaf as f64;
            }
            if stage_sum < stage.threshold as f64 {
                return false;
            }
        }
        true
    }
}

/// Summed-area tables for pixel values and squared pixel values.
pub(crate) struct IntegralImage {
    stride: usize,
    sum: Vec<i64>,
    sqsum: Vec<i64>,
}

impl IntegralImage {
    pub(crate) fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0i64; stride * (h + 1)];
        let mut sqsum = vec![0i64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row_sum = 0i64;
            let mut row_sq = 0i64;
            for x in 0..w {
                let v = raw[y * w + x] as i64;
                row_sum += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sqsum[idx] = sqsum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn rect(&self, table: &[i64], x: u32, y: u32, w: u32, h: u32) -> i64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * self.stride + x1] - table[y0 * self.stride + x1] - table[y1 * self.stride + x0]
            + table[y0 * self.stride + x0]
    }

    pub(crate) fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        self.rect(&self.sum, x, y, w, h)
    }

    pub(crate) fn sqsum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        self.rect(&self.sqsum, x, y, w, h)
    }
}

/// Raw values collected while walking the XML, validated by `build`.
#[derive(Default)]
struct CascadeDraft {
    saw_cascade: bool,
    legacy: bool,
    stage_type: Option<String>,
    feature_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

fn parse_cascade(xml: &str) -> Result<CascadeDraft, CascadeError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut draft = CascadeDraft::default();
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"type_id"
                        && attr.value.as_ref() == b"opencv-haar-classifier"
                    {
                        draft.legacy = true;
                    }
                }
                let parent = path.last().map(String::as_str);
                match (parent, name.as_str()) {
                    (_, "cascade") => draft.saw_cascade = true,
                    (Some("stages"), "_") => draft.stages.push(Stage::default()),
                    (Some("weakClassifiers"), "_") => {
                        current_stage(&mut draft)?
                            .classifiers
                            .push(WeakClassifier::default());
                    }
                    (Some("features"), "_") => draft.features.push(HaarFeature::default()),
                    _ => {}
                }
                path.push(name);
                text.clear();
            }
            Event::Text(t) => {
                text.push_str(&t.unescape()?);
            }
            Event::End(_) => {
                handle_leaf(&mut draft, &path, text.trim())?;
                path.pop();
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(draft)
}

fn current_stage(draft: &mut CascadeDraft) -> Result<&mut Stage, CascadeError> {
    draft
        .stages
        .last_mut()
        .ok_or_else(|| CascadeError::Malformed("weak classifier outside of a stage".into()))
}

fn handle_leaf(draft: &mut CascadeDraft, path: &[String], text: &str) -> Result<(), CascadeError> {
    let n = path.len();
    let at = |i: usize| -> &str {
        if i < n {
            path[n - 1 - i].as_str()
        } else {
            ""
        }
    };

    match (at(2), at(1), at(0)) {
        (_, "cascade", "stageType") => draft.stage_type = Some(text.to_string()),
        (_, "cascade", "featureType") => draft.feature_type = Some(text.to_string()),
        (_, "cascade", "width") => draft.width = Some(parse_num(text, "width")?),
        (_, "cascade", "height") => draft.height = Some(parse_num(text, "height")?),
        ("stages", "_", "stageThreshold") => {
            current_stage(draft)?.threshold = parse_num(text, "stageThreshold")?;
        }
        ("weakClassifiers", "_", "internalNodes") => {
            let nodes = parse_nodes(text)?;
            current_weak(draft)?.nodes = nodes;
        }
        ("weakClassifiers", "_", "leafValues") => {
            let leaves = text
                .split_whitespace()
                .map(|v| parse_num(v, "leafValues"))
                .collect::<Result<Vec<f32>, _>>()?;
            current_weak(draft)?.leaves = leaves;
        }
        ("_", "rects", "_") if at(3) == "features" => {
            let rect = parse_rect(text)?;
            current_feature(draft)?.rects.push(rect);
        }
        ("features", "_", "tilted") => {
            current_feature(draft)?.tilted = text != "0";
        }
        _ => {}
    }
    Ok(())
}

fn current_weak(draft: &mut CascadeDraft) -> Result<&mut WeakClassifier, CascadeError> {
    current_stage(draft)?
        .classifiers
        .last_mut()
        .ok_or_else(|| CascadeError::Malformed("node data outside of a weak classifier".into()))
}

fn current_feature(draft: &mut CascadeDraft) -> Result<&mut HaarFeature, CascadeError> {
    draft
        .features
        .last_mut()
        .ok_or_else(|| CascadeError::Malformed("rect outside of a feature".into()))
}

fn parse_num<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, CascadeError> {
    text.trim()
        .parse()
        .map_err(|_| CascadeError::Malformed(format!("bad {what} value: {text:?}")))
}

/// `internalNodes` holds groups of `left right featureIdx threshold`.
fn parse_nodes(text: &str) -> Result<Vec<Node>, CascadeError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() || tokens.len() % 4 != 0 {
        return Err(CascadeError::Unsupported(format!(
            "internalNodes must hold groups of 4 values, got {} (categorical features?)",
            tokens.len()
        )));
    }
    tokens
        .chunks(4)
        .map(|c| {
            Ok(Node {
                left: parse_num(c[0], "node left")?,
                right: parse_num(c[1], "node right")?,
                feature: parse_num(c[2], "node feature index")?,
                threshold: parse_num(c[3], "node threshold")?,
            })
        })
        .collect()
}

/// Rect entries are `x y width height weight`.
fn parse_rect(text: &str) -> Result<WeightedRect, CascadeError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() != 5 {
        return Err(CascadeError::Malformed(format!(
            "feature rect needs 5 values, got {}",
            tokens.len()
        )));
    }
    Ok(WeightedRect {
        x: parse_num(tokens[0], "rect x")?,
        y: parse_num(tokens[1], "rect y")?,
        width: parse_num(tokens[2], "rect width")?,
        height: parse_num(tokens[3], "rect height")?,
        weight: parse_num(tokens[4], "rect weight")?,
    })
}

impl CascadeDraft {
    fn build(self) -> Result<Cascade, CascadeError> {
        if !self.saw_cascade {
            return Err(if self.legacy {
                CascadeError::Unsupported(
                    "legacy opencv-haar-classifier format; use a cascade from OpenCV >= 2.4".into(),
                )
            } else {
                CascadeError::Malformed("no <cascade> element".into())
            });
        }

        match self.stage_type.as_deref() {
            Some("BOOST") => {}
            other => {
                return Err(CascadeError::Unsupported(format!("stage type {other:?}")));
            }
        }
        match self.feature_type.as_deref() {
            Some("HAAR") => {}
            other => {
                return Err(CascadeError::Unsupported(format!("feature type {other:?}")));
            }
        }

        let width = self
            .width
            .ok_or_else(|| CascadeError::Malformed("missing <width>".into()))?;
        let height = self
            .height
            .ok_or_else(|| CascadeError::Malformed("missing <height>".into()))?;
        if width < 3 || height < 3 {
            return Err(CascadeError::Malformed(format!(
                "window {width}x{height} is too small"
            )));
        }

        if self.stages.is_empty() {
            return Err(CascadeError::Malformed("cascade has no stages".into()));
        }

        for (i, feature) in self.features.iter().enumerate() {
            if feature.tilted {
                return Err(CascadeError::Unsupported(format!(
                    "feature {i} is tilted; only upright Haar features are supported"
                )));
            }
            if feature.rects.is_empty() {
                return Err(CascadeError::Malformed(format!("feature {i} has no rects")));
            }
            for r in &feature.rects {
                if r.x + r.width > width || r.y + r.height > height {
                    return Err(CascadeError::Malformed(format!(
                        "feature {i} rect {r:?} exceeds the {width}x{height} window"
                    )));
                }
            }
        }

        for (si, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(CascadeError::Malformed(format!("stage {si} is empty")));
            }
            for weak in &stage.classifiers {
                validate_weak(weak, self.features.len())
                    .map_err(|e| CascadeError::Malformed(format!("stage {si}: {e}")))?;
            }
        }

        Ok(Cascade {
            window_width: width,
            window_height: height,
            stages: self.stages,
            features: self.features,
        })
    }
}

fn validate_weak(weak: &WeakClassifier, feature_count: usize) -> Result<(), String> {
    if weak.nodes.is_empty() {
        return Err("weak classifier has no nodes".into());
    }
    // Child links must point forward so evaluation always reaches a leaf.
    let in_range = |current: usize, link: i32| -> bool {
        if link > 0 {
            (link as usize) > current && (link as usize) < weak.nodes.len()
        } else {
            (link.unsigned_abs() as usize) < weak.leaves.len()
        }
    };
    for (i, node) in weak.nodes.iter().enumerate() {
        if node.feature >= feature_count {
            return Err(format!(
                "feature index {} out of range ({feature_count} features)",
                node.feature
            ));
        }
        if !in_range(i, node.left) || !in_range(i, node.right) {
            return Err(format!(
                "node links ({}, {}) out of range ({} nodes, {} leaves)",
                node.left,
                node.right,
                weak.nodes.len(),
                weak.leaves.len()
            ));
        }
    }
    Ok(())
}
