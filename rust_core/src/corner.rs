//! Corner plot: marginal histograms on the diagonal, pairwise scatter
//! below it, optional truth markers. Rendered to SVG without text.

use std::ops::Range;
use std::path::Path;

use log::debug;
use plotters::coord::types::RangedCoordf64;
use plotters::prelude::*;

use crate::error::{Error, Result};

const STEEL_BLUE: RGBColor = RGBColor(70, 130, 180);

#[derive(Debug, Clone)]
pub struct CornerOptions {
    pub bins: usize,
    /// Side length of one panel in pixels.
    pub panel_size: u32,
    /// Scatter panels are thinned to at most this many points.
    pub max_points: usize,
}

impl Default for CornerOptions {
    fn default() -> Self {
        Self {
            bins: 30,
            panel_size: 240,
            max_points: 3000,
        }
    }
}

fn plot_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Plot(e.to_string())
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Insert `<title>` and `<desc>` right after the opening `<svg>` tag so the
/// panels can be identified without rendering any text.
fn label_svg(svg: &str, names: &[String]) -> String {
    let escaped: Vec<String> = names.iter().map(|n| xml_escape(n)).collect();
    let labels = format!(
        "<title>corner plot: {0}</title><desc>rows and columns in order {0}; \
         the column parameter is on x, the row parameter on y, histograms on the diagonal</desc>",
        escaped.join(", ")
    );
    match svg.find("<svg").and_then(|at| svg[at..].find('>').map(|end| at + end + 1)) {
        Some(pos) => format!("{}{}{}", &svg[..pos], labels, &svg[pos..]),
        None => svg.to_string(),
    }
}

/// Range covering the central 99% of `values` plus a small margin, widened
/// to include `truth`.
fn axis_range(values: &[f64], truth: Option<f64>) -> Range<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    if sorted.is_empty() {
        return 0.0..1.0;
    }
    let at = |q: f64| sorted[((sorted.len() - 1) as f64 * q).round() as usize];
    let (mut lo, mut hi) = (at(0.005), at(0.995));
    if let Some(t) = truth.filter(|t| t.is_finite()) {
        lo = lo.min(t);
        hi = hi.max(t);
    }
    let pad = if hi > lo {
        0.05 * (hi - lo)
    } else {
        1e-3 * lo.abs().max(1.0)
    };
    (lo - pad)..(hi + pad)
}

/// Bin counts of `values` over `range`; values outside are dropped.
fn histogram(values: &[f64], range: &Range<f64>, bins: usize) -> Vec<usize> {
    let mut counts = vec![0usize; bins];
    let width = (range.end - range.start) / bins as f64;
    for &v in values {
        if v < range.start || v >= range.end {
            continue;
        }
        let b = (((v - range.start) / width) as usize).min(bins - 1);
        counts[b] += 1;
    }
    counts
}

/// Write a corner plot of `samples[draw][param]` to an SVG file.
///
/// Panel rows and columns follow the order of `names`: the panel in row `i`
/// and column `j` shows parameter `j` on x and parameter `i` on y. The names
/// are recorded in the SVG `<title>`.
pub fn corner_plot<P: AsRef<Path>>(
    path: P,
    samples: &[Vec<f64>],
    names: &[String],
    truths: Option<&[f64]>,
) -> Result<()> {
    corner_plot_with(path, samples, names, truths, &CornerOptions::default())
}

pub fn corner_plot_with<P: AsRef<Path>>(
    path: P,
    samples: &[Vec<f64>],
    names: &[String],
    truths: Option<&[f64]>,
    options: &CornerOptions,
) -> Result<()> {
    let dim = names.len();
    if dim == 0 || samples.is_empty() {
        return Err(Error::Plot("nothing to plot".to_string()));
    }
    if options.bins == 0 || options.max_points == 0 {
        return Err(Error::InvalidConfig {
            field: "corner",
            reason: "bins and max_points must be positive".to_string(),
        });
    }
    if let Some(bad) = samples.iter().find(|s| s.len() != dim) {
        return Err(Error::Dimension {
            expected: dim,
            found: bad.len(),
        });
    }
    if let Some(t) = truths {
        crate::error::check_dim(t, dim)?;
    }

    let columns: Vec<Vec<f64>> = (0..dim)
        .map(|p| samples.iter().map(|s| s[p]).collect())
        .collect();
    let truth = |p: usize| truths.map(|t| t[p]);
    let ranges: Vec<Range<f64>> = (0..dim)
        .map(|p| axis_range(&columns[p], truth(p)))
        .collect();
    let stride = samples.len().div_ceil(options.max_points);

    let side = options.panel_size * dim as u32;
    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, (side, side)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;
        let panels = root.split_evenly((dim, dim));

        for row in 0..dim {
            for col in 0..=row {
                let panel = &panels[row * dim + col];
                let x_range = ranges[col].clone();
                if row == col {
                    let counts = histogram(&columns[col], &x_range, options.bins);
                    let peak = counts.iter().copied().max().unwrap_or(0).max(1) as f64;
                    let y_range = 0.0..peak * 1.1;
                    let mut chart = ChartBuilder::on(panel)
                        .margin(6)
                        .build_cartesian_2d(x_range.clone(), y_range.clone())
                        .map_err(plot_err)?;
                    let width = (x_range.end - x_range.start) / options.bins as f64;
                    chart
                        .draw_series(counts.iter().enumerate().map(|(b, &c)| {
                            let x0 = x_range.start + b as f64 * width;
                            Rectangle::new([(x0, 0.0), (x0 + width, c as f64)], STEEL_BLUE.filled())
                        }))
                        .map_err(plot_err)?;
                    frame(&mut chart, &x_range, &y_range)?;
                    if let Some(t) = truth(col) {
                        chart
                            .draw_series(std::iter::once(PathElement::new(
                                vec![(t, y_range.start), (t, y_range.end)],
                                RED.stroke_width(2),
                            )))
                            .map_err(plot_err)?;
                    }
                } else {
                    let y_range = ranges[row].clone();
                    let mut chart = ChartBuilder::on(panel)
                        .margin(6)
                        .build_cartesian_2d(x_range.clone(), y_range.clone())
                        .map_err(plot_err)?;
                    chart
                        .draw_series(samples.iter().step_by(stride).map(|s| {
                            Circle::new((s[col], s[row]), 1, STEEL_BLUE.mix(0.4).filled())
                        }))
                        .map_err(plot_err)?;
                    frame(&mut chart, &x_range, &y_range)?;
                    if let (Some(tx), Some(ty)) = (truth(col), truth(row)) {
                        let style = RED.stroke_width(1);
                        chart
                            .draw_series([
                                PathElement::new(vec![(tx, y_range.start), (tx, y_range.end)], style),
                                PathElement::new(vec![(x_range.start, ty), (x_range.end, ty)], style),
                            ])
                            .map_err(plot_err)?;
                        chart
                            .draw_series(std::iter::once(Circle::new((tx, ty), 3, RED.filled())))
                            .map_err(plot_err)?;
                    }
                }
            }
        }

        root.present().map_err(plot_err)?;
    }
    std::fs::write(path.as_ref(), label_svg(&svg, names))?;
    debug!(
        "corner plot of {} draws ({} params) written to {}",
        samples.len(),
        dim,
        path.as_ref().display()
    );
    Ok(())
}

fn frame<DB: DrawingBackend>(
    chart: &mut ChartContext<'_, DB, Cartesian2d<RangedCoordf64, RangedCoordf64>>,
    x: &Range<f64>,
    y: &Range<f64>,
) -> Result<()> {
    chart
        .draw_series(std::iter::once(Rectangle::new(
            [(x.start, y.start), (x.end, y.end)],
            BLACK.stroke_width(1),
        )))
        .map_err(plot_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["m".to_string(), "b".to_string()]
    }

    #[test]
    fn histogram_counts_in_range_values() {
        let counts = histogram(&[0.1, 0.2, 0.6, 0.99, 1.5, -0.2], &(0.0..1.0), 2);
        assert_eq!(counts, vec![2, 2]);
    }

    #[test]
    fn range_includes_truth() {
        let r = axis_range(&[0.0, 0.1, 0.2], Some(5.0));
        assert!(r.start < 0.0 && r.end > 5.0);
        let flat = axis_range(&[2.0, 2.0], None);
        assert!(flat.end > flat.start);
    }

    #[test]
    fn writes_an_svg() {
        let samples: Vec<Vec<f64>> = (0..500)
            .map(|i| {
                let t = i as f64 / 500.0;
                vec![t, (6.0 * t).sin()]
            })
            .collect();
        let path = std::env::temp_dir().join(format!("linfit_corner_{}.svg", std::process::id()));
        corner_plot(&path, &samples, &names(), Some([0.5, 0.0].as_slice())).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("<svg"));
        assert!(text.contains("<title>corner plot: m, b</title>"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn labels_follow_the_svg_tag() {
        let svg = "<?xml version=\"1.0\"?>\n<svg width=\"10\">\n<rect/></svg>";
        let labelled = label_svg(svg, &["a<b".to_string(), "c".to_string()]);
        let title = labelled.find("<title>corner plot: a&lt;b, c</title>").unwrap();
        assert!(title > labelled.find("<svg").unwrap());
        assert!(title < labelled.find("<rect/>").unwrap());
        assert_eq!(label_svg("no markup", &[]), "no markup");
    }

    #[test]
    fn rejects_ragged_draws() {
        let samples = vec![vec![0.0, 1.0], vec![0.0]];
        let path = std::env::temp_dir().join("linfit_corner_ragged.svg");
        assert!(matches!(
            corner_plot(&path, &samples, &names(), None),
            Err(Error::Dimension { .. })
        ));
    }
}
