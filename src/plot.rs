use plotters::coord::Shift;
use plotters::prelude::*;
use std::error::Error;
use std::fs;
use std::path::Path;

use crate::across_k::AnchorKind;
use crate::error::{AlignError, Result};
use crate::matrix::MembershipMatrix;
use crate::pipeline::{KResult, PipelineResult};
use crate::report::VISUALIZATION_DIR;

type DrawResult = std::result::Result<(), Box<dyn Error + Send + Sync>>;

/// Default cluster colours (distruct palette order)
const DEFAULT_COLORS: &[(u8, u8, u8)] = &[
    (0xff, 0x99, 0x00),
    (0x00, 0x66, 0xcc),
    (0x99, 0xcc, 0x33),
    (0xcc, 0x33, 0x66),
    (0x66, 0x33, 0x99),
    (0xff, 0xcc, 0x00),
    (0x33, 0x99, 0x99),
    (0x99, 0x66, 0x33),
    (0xff, 0x66, 0x99),
    (0x66, 0x99, 0xff),
    (0x33, 0x66, 0x00),
    (0x99, 0x00, 0x00),
    (0xcc, 0x99, 0xff),
    (0x00, 0x33, 0x66),
    (0xcc, 0xcc, 0x99),
    (0x66, 0x66, 0x66),
    (0xff, 0x33, 0x00),
    (0x00, 0xcc, 0x99),
    (0x99, 0x99, 0x00),
    (0x33, 0x00, 0x33),
];

/// Colours indexed by lineage label
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    colors: Vec<RGBColor>,
    /// True when fewer colours than clusters were given and they repeat
    pub recycled: bool,
}

impl Palette {
    pub fn default_for(k_max: usize) -> Self {
        Self {
            colors: DEFAULT_COLORS.iter().map(|&(r, g, b)| RGBColor(r, g, b)).collect(),
            recycled: k_max > DEFAULT_COLORS.len(),
        }
    }

    /// Comma separated `#rrggbb` colours
    pub fn from_spec(spec: &str, k_max: usize) -> Result<Self> {
        let mut colors = Vec::new();
        for raw in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            colors.push(parse_hex_color(raw).ok_or_else(|| {
                AlignError::Configuration(format!("invalid colour '{}', expected #rrggbb", raw))
            })?);
        }
        if colors.is_empty() {
            return Err(AlignError::Configuration("colour map is empty".to_string()));
        }
        Ok(Self {
            recycled: k_max > colors.len(),
            colors,
        })
    }

    pub fn color(&self, label: usize) -> RGBColor {
        self.colors[label % self.colors.len()]
    }
}

fn parse_hex_color(raw: &str) -> Option<RGBColor> {
    let hex = raw.strip_prefix('#').unwrap_or(raw);
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some(RGBColor(channel(0)?, channel(2)?, channel(4)?))
}

fn plot_error(e: Box<dyn Error + Send + Sync>) -> AlignError {
    AlignError::Plot(e.to_string())
}

/// Stacked membership bars, one per individual, filling `area`.
///
/// `labels[c]` picks the colour of column `c`; columns are stacked in label order so the
/// same lineage sits at the same height in every plot.
fn draw_structure(area: &DrawingArea<BitMapBackend<'_>, Shift>, matrix: &MembershipMatrix, labels: &[usize], palette: &Palette) -> DrawResult {
    let (width, height) = area.dim_in_pixel();
    let n = matrix.rows();
    let mut order: Vec<usize> = (0..matrix.cols()).collect();
    order.sort_by_key(|&c| labels.get(c).copied().unwrap_or(c));

    for i in 0..n {
        let x0 = (i * width as usize / n) as i32;
        let x1 = ((i + 1) * width as usize / n) as i32;
        let mut y = height as f64;
        for &c in &order {
            let h = matrix.get(i, c) * height as f64;
            if h <= 0.0 {
                continue;
            }
            let top = y - h;
            let color = palette.color(labels.get(c).copied().unwrap_or(c));
            area.draw(&Rectangle::new(
                [(x0, top.round() as i32), (x1, y.round() as i32)],
                color.filled(),
            ))?;
            y = top;
        }
    }
    Ok(())
}

fn draw_colorbar(path: &Path, palette: &Palette, labels: usize) -> DrawResult {
    let cell = 40u32;
    let root = BitMapBackend::new(path, (cell * labels.max(1) as u32, cell)).into_drawing_area();
    root.fill(&WHITE)?;
    for label in 0..labels {
        let x = (label as u32 * cell) as i32;
        root.draw(&Rectangle::new([(x, 0), (x + cell as i32, cell as i32)], palette.color(label).filled()))?;
    }
    root.present()?;
    Ok(())
}

/// One swatch per lineage label `0..labels`
pub fn plot_colorbar(path: &Path, palette: &Palette, labels: usize) -> Result<()> {
    draw_colorbar(path, palette, labels).map_err(plot_error)
}

fn draw_mode_structure(path: &Path, matrix: &MembershipMatrix, labels: &[usize], palette: &Palette) -> DrawResult {
    let root = BitMapBackend::new(path, (1200, 300)).into_drawing_area();
    root.fill(&WHITE)?;
    let inner = root.margin(10, 10, 10, 10);
    draw_structure(&inner, matrix, labels, palette)?;
    root.present()?;
    Ok(())
}

pub fn plot_mode_structure(path: &Path, matrix: &MembershipMatrix, labels: &[usize], palette: &Palette) -> Result<()> {
    draw_mode_structure(path, matrix, labels, palette).map_err(plot_error)
}

/// Lineage label of every column of one mode.
///
/// Falls back to the within-K order against the major mode when no across-K lineage exists.
pub fn column_labels(result: &PipelineResult, k_result: &KResult, mode: usize) -> Vec<usize> {
    let labels = result.across_k.labels(k_result.k, mode);
    if labels.len() == k_result.k {
        return labels;
    }
    let mut fallback: Vec<usize> = (0..k_result.k).collect();
    if let Some(summary) = k_result.extraction.modes.get(mode) {
        for (c, &col) in summary.alignment_to_major.iter().enumerate() {
            if col < fallback.len() {
                fallback[col] = c;
            }
        }
    }
    fallback
}

fn anchor_matrix(k_result: &KResult, mode: usize, anchor: AnchorKind) -> Option<&MembershipMatrix> {
    k_result.extraction.modes.get(mode).map(|m| match anchor {
        AnchorKind::Representative => &m.representative_matrix,
        AnchorKind::Consensus => &m.consensus,
    })
}

fn draw_multipartite(path: &Path, result: &PipelineResult, palette: &Palette) -> DrawResult {
    let rows = result.per_k.len().max(1);
    let max_modes = result
        .per_k
        .iter()
        .map(|r| r.extraction.modes.len())
        .max()
        .unwrap_or(1)
        .max(1);
    let anchor = result.across_k.anchor;
    let root = BitMapBackend::new(path, (400 * max_modes as u32, 160 * rows as u32)).into_drawing_area();
    root.fill(&WHITE)?;

    for (row_area, k_result) in root.split_evenly((rows, 1)).iter().zip(&result.per_k) {
        for (mode, cell) in row_area.split_evenly((1, max_modes)).iter().enumerate() {
            let Some(matrix) = anchor_matrix(k_result, mode, anchor) else {
                continue;
            };
            let size = k_result.extraction.modes[mode].stats.size;
            let best = result
                .across_k
                .best_pairs
                .iter()
                .any(|e| (e.low.k == k_result.k && e.low.mode == mode) || (e.high.k == k_result.k && e.high.mode == mode));
            let title = format!(
                "K{}M{} ({}){}",
                k_result.k,
                mode + 1,
                size,
                if best { " *" } else { "" }
            );
            let titled = cell.margin(4, 4, 6, 6).titled(&title, ("sans-serif", 16))?;
            draw_structure(&titled, matrix, &column_labels(result, k_result, mode), palette)?;
        }
    }
    root.present()?;
    Ok(())
}

/// All modes of all K on one canvas, one row per K; best across-K pairs are starred
pub fn plot_multipartite(path: &Path, result: &PipelineResult, palette: &Palette) -> Result<()> {
    draw_multipartite(path, result, palette).map_err(plot_error)
}

/// Colour bar, one structure plot per mode and the multipartite summary under `output`
pub fn write_visualizations(output: &Path, result: &PipelineResult, palette: &Palette) -> Result<()> {
    let dir = output.join(VISUALIZATION_DIR);
    fs::create_dir_all(&dir)?;
    let k_max = result.per_k.iter().map(|r| r.k).max().unwrap_or(0);
    let labels = result
        .across_k
        .lineages
        .iter()
        .map(|e| e.label + 1)
        .max()
        .unwrap_or(0)
        .max(k_max);
    plot_colorbar(&dir.join("colorbar.png"), palette, labels)?;

    let anchor = result.across_k.anchor;
    let suffix = anchor.suffix();
    for k_result in &result.per_k {
        for mode in 0..k_result.extraction.modes.len() {
            if let Some(matrix) = anchor_matrix(k_result, mode, anchor) {
                let path = dir.join(format!("K{}M{}_{}.png", k_result.k, mode + 1, suffix));
                plot_mode_structure(&path, matrix, &column_labels(result, k_result, mode), palette)?;
            }
        }
    }
    plot_multipartite(&dir.join(format!("modes_multipartite_{}.png", suffix)), result, palette)?;
    Ok(())
}
