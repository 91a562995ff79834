//! PNG diagnostics of the good calibrations.

use std::error::Error;
use std::path::{Path, PathBuf};

use log::info;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::register_font;

use crate::engine::{GoodCalibration, ResultObserver};
use crate::ndarray_utils::min_max;

const MAX_COLUMNS: usize = 6;
const BAND: RGBColor = RGBColor(190, 190, 190);
const FONT_FAMILY: &str = "sans-serif";

/// Draws one panel per good calibration: catalog vs. observed magnitudes,
/// the fitted relation `omag = cmag + zeropoint` and its ±σ band.
///
/// The selected calibration is framed in red.
/// Captions and axis labels need a font, see [`with_font`](Self::with_font);
/// without one, the panels carry no text.
#[derive(Clone, Debug)]
pub struct PlotRenderer {
    path: PathBuf,
    panel_size: (u32, u32),
    font: Option<&'static [u8]>,
}

impl PlotRenderer {
    /// Render into the PNG file at `path`. The file is overwritten on every job.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            panel_size: (400, 400),
            font: None,
        }
    }

    /// Set the size of a single panel in pixels. Default: 400×400.
    pub fn with_panel_size(mut self, width: u32, height: u32) -> Self {
        self.panel_size = (width.max(1), height.max(1));
        self
    }

    /// Label the panels using the TrueType/OpenType font in `bytes`,
    /// e.g. `include_bytes!("DejaVuSans.ttf")`.
    pub fn with_font(mut self, bytes: &'static [u8]) -> Self {
        self.font = Some(bytes);
        self
    }

    /// Output file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn grid(n: usize) -> (usize, usize) {
        let ncols = n.min(MAX_COLUMNS);
        (n.div_ceil(ncols), ncols)
    }
}

impl ResultObserver for PlotRenderer {
    fn observe(&mut self, good: &[GoodCalibration<'_>]) -> Result<(), Box<dyn Error>> {
        if good.is_empty() {
            return Ok(());
        }
        let labels = match self.font {
            Some(bytes) => {
                register_font(FONT_FAMILY, FontStyle::Normal, bytes)
                    .map_err(|_| "the plot font is not a valid TrueType/OpenType font")?;
                true
            }
            None => false,
        };
        let (nrows, ncols) = Self::grid(good.len());
        let size = (
            self.panel_size.0 * ncols as u32,
            self.panel_size.1 * nrows as u32,
        );

        let root = BitMapBackend::new(&self.path, size).into_drawing_area();
        root.fill(&WHITE)?;
        for (panel, calibration) in root.split_evenly((nrows, ncols)).iter().zip(good) {
            draw_panel(panel, calibration, labels)?;
        }
        root.present()?;

        info!(
            "Plotted {} calibrations to '{}'.",
            good.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn draw_panel(
    area: &DrawingArea<BitMapBackend<'_>, Shift>,
    calibration: &GoodCalibration<'_>,
    labels: bool,
) -> Result<(), Box<dyn Error>> {
    let result = calibration.result;
    let (zp, sigma) = (result.zeropoint, result.scatter);
    let (Some((xmin, xmax)), Some((ymin, ymax))) =
        (min_max(result.cmag.view()), min_max(result.omag.view()))
    else {
        return Ok(());
    };
    let (xmin, xmax) = (xmin - 0.5, xmax + 0.5);
    let (ymin, ymax) = (ymin - 0.5, ymax + 0.5);

    let mut builder = ChartBuilder::on(area);
    builder.margin(10);
    if labels {
        builder
            .caption(
                format!(
                    "{} {}: ZP {:.3} ± {:.3}",
                    calibration.survey, calibration.filter, zp, sigma
                ),
                (FONT_FAMILY, 16),
            )
            .x_label_area_size(35)
            .y_label_area_size(45);
    }
    let mut chart = builder.build_cartesian_2d(xmin..xmax, ymin..ymax)?;

    if labels {
        chart
            .configure_mesh()
            .x_desc("catalog mag")
            .y_desc("observed mag")
            .label_style((FONT_FAMILY, 12))
            .axis_desc_style((FONT_FAMILY, 12))
            .light_line_style(WHITE)
            .draw()?;
    } else {
        chart.plotting_area().draw(&Rectangle::new(
            [(xmin, ymin), (xmax, ymax)],
            BLACK.stroke_width(1),
        ))?;
    }

    chart.draw_series(std::iter::once(Polygon::new(
        vec![
            (xmin, xmin + zp - sigma),
            (xmax, xmax + zp - sigma),
            (xmax, xmax + zp + sigma),
            (xmin, xmin + zp + sigma),
        ],
        BAND.mix(0.6).filled(),
    )))?;
    chart.draw_series(
        result
            .cmag
            .iter()
            .zip(&result.omag)
            .map(|(c, o)| Circle::new((*c, *o), 3, BLUE.mix(0.15).filled())),
    )?;
    chart.draw_series(LineSeries::new(
        [(xmin, xmin + zp), (xmax, xmax + zp)],
        RED.stroke_width(2),
    ))?;

    if calibration.selected {
        let (w, h) = area.dim_in_pixel();
        area.draw(&Rectangle::new(
            [(1, 1), (w as i32 - 2, h as i32 - 2)],
            RED.stroke_width(4),
        ))?;
    }
    Ok(())
}
