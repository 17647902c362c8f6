// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Dominant color classification
//!
//! Pixels are stride-sampled down to at most `sample_size²` points. Each
//! sample is dark, achromatic (white/gray) or lands in one of `hue_sectors`
//! equal sectors of the hue wheel. Dark classification always comes first, so
//! a dark pixel never contributes to a hue.

use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

use crate::config::ColorConfig;

/// Saturation below which a pixel has no meaningful hue
const ACHROMATIC_SATURATION: f32 = 0.15;
/// Value at or above which an achromatic pixel is white
const WHITE_VALUE: f32 = 0.90;
/// Whole-image mean luminance at or below which the image is dark
const IMAGE_DARK_LUMA: f32 = 0.05;
/// Whole-image mean luminance at or above which a desaturated image is white
const IMAGE_WHITE_LUMA: f32 = 0.94;

/// Bucket names; declaration order breaks ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorName {
    Dark,
    White,
    Gray,
    Red,
    Orange,
    Yellow,
    Green,
    Cyan,
    Blue,
    Magenta,
}

impl ColorName {
    pub const ALL: [ColorName; 10] = [
        ColorName::Dark,
        ColorName::White,
        ColorName::Gray,
        ColorName::Red,
        ColorName::Orange,
        ColorName::Yellow,
        ColorName::Green,
        ColorName::Cyan,
        ColorName::Blue,
        ColorName::Magenta,
    ];

    /// Canonical hues in degrees, used to name hue sectors
    const HUES: [(ColorName, f32); 7] = [
        (ColorName::Red, 0.0),
        (ColorName::Orange, 30.0),
        (ColorName::Yellow, 60.0),
        (ColorName::Green, 120.0),
        (ColorName::Cyan, 180.0),
        (ColorName::Blue, 240.0),
        (ColorName::Magenta, 300.0),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ColorName::Dark => "dark",
            ColorName::White => "white",
            ColorName::Gray => "gray",
            ColorName::Red => "red",
            ColorName::Orange => "orange",
            ColorName::Yellow => "yellow",
            ColorName::Green => "green",
            ColorName::Cyan => "cyan",
            ColorName::Blue => "blue",
            ColorName::Magenta => "magenta",
        }
    }

    pub fn is_chromatic(&self) -> bool {
        !matches!(self, ColorName::Dark | ColorName::White | ColorName::Gray)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for ColorName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorBucket {
    pub name: ColorName,
    /// Mean hue of the winning sector's samples; `None` for achromatic buckets
    pub hue: Option<f32>,
    pub dark_ratio: f32,
    pub samples: u32,
}

/// Name of the sector a hue falls into
///
/// Sectors are centred at `i * 360 / sectors`; each is named after the
/// canonical hue nearest to its centre.
pub fn sector_name(hue: f32, sectors: u16) -> ColorName {
    let sectors = sectors.max(1) as f32;
    let width = 360.0 / sectors;
    let index = (hue.rem_euclid(360.0) / width).round() % sectors;
    let centre = index * width;

    let mut best = ColorName::HUES[0];
    let mut best_distance = f32::MAX;
    for (name, canonical) in ColorName::HUES {
        let distance = hue_distance(centre, canonical);
        if distance < best_distance {
            best = (name, canonical);
            best_distance = distance;
        }
    }
    best.0
}

fn hue_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

/// One sampled pixel, reduced to what classification needs
#[derive(Debug, Clone, Copy)]
struct Sample {
    luma: f32,
    saturation: f32,
    value: f32,
    hue: f32,
}

impl Sample {
    fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        let (r, g, b) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let hue = if delta <= f32::EPSILON {
            0.0
        } else if max == r {
            60.0 * ((g - b) / delta).rem_euclid(6.0)
        } else if max == g {
            60.0 * ((b - r) / delta + 2.0)
        } else {
            60.0 * ((r - g) / delta + 4.0)
        };

        Self {
            // Rec. 709
            luma: 0.2126 * r + 0.7152 * g + 0.0722 * b,
            saturation: if max <= 0.0 { 0.0 } else { delta / max },
            value: max,
            hue,
        }
    }

    fn classify(&self, config: &ColorConfig) -> ColorName {
        if self.luma < config.dark_threshold {
            ColorName::Dark
        } else if self.saturation < ACHROMATIC_SATURATION {
            if self.value >= WHITE_VALUE {
                ColorName::White
            } else {
                ColorName::Gray
            }
        } else {
            sector_name(self.hue, config.hue_sectors)
        }
    }
}

#[derive(Default)]
struct Tally {
    counts: [u32; 10],
    // Hue accumulated as unit vectors so red near 0°/360° averages correctly
    hue_sin: [f64; 10],
    hue_cos: [f64; 10],
    luma_sum: f64,
    saturation_sum: f64,
    samples: u32,
}

impl Tally {
    fn add(&mut self, sample: Sample, name: ColorName) {
        let i = name.index();
        self.counts[i] += 1;
        if name.is_chromatic() {
            let radians = (sample.hue as f64).to_radians();
            self.hue_sin[i] += radians.sin();
            self.hue_cos[i] += radians.cos();
        }
        self.luma_sum += sample.luma as f64;
        self.saturation_sum += sample.saturation as f64;
        self.samples += 1;
    }

    fn mean_hue(&self, name: ColorName) -> Option<f32> {
        if !name.is_chromatic() || self.counts[name.index()] == 0 {
            return None;
        }
        let i = name.index();
        let degrees = self.hue_sin[i].atan2(self.hue_cos[i]).to_degrees().rem_euclid(360.0);
        Some(degrees as f32)
    }

    /// Majority bucket; the first name in declaration order wins a tie
    fn majority(&self) -> ColorName {
        let mut best = ColorName::Dark;
        let mut best_count = 0;
        for name in ColorName::ALL {
            let count = self.counts[name.index()];
            if count > best_count {
                best = name;
                best_count = count;
            }
        }
        best
    }
}

/// Classify an image into a single dominant color bucket
pub fn classify(image: &DynamicImage, config: &ColorConfig) -> ColorBucket {
    let (width, height) = image.dimensions();
    let limit = config.sample_size.max(1);
    let step_x = width.div_ceil(limit).max(1);
    let step_y = height.div_ceil(limit).max(1);

    let mut tally = Tally::default();
    for y in (0..height).step_by(step_y as usize) {
        for x in (0..width).step_by(step_x as usize) {
            let pixel = image.get_pixel(x, y);
            let sample = Sample::from_rgb(pixel[0], pixel[1], pixel[2]);
            tally.add(sample, sample.classify(config));
        }
    }

    if tally.samples == 0 {
        return ColorBucket {
            name: ColorName::Dark,
            hue: None,
            dark_ratio: 1.0,
            samples: 0,
        };
    }

    let n = tally.samples as f64;
    let mean_luma = (tally.luma_sum / n) as f32;
    let mean_saturation = (tally.saturation_sum / n) as f32;

    let name = if mean_luma <= IMAGE_DARK_LUMA {
        ColorName::Dark
    } else if mean_luma >= IMAGE_WHITE_LUMA && mean_saturation < ACHROMATIC_SATURATION {
        ColorName::White
    } else {
        tally.majority()
    };

    ColorBucket {
        name,
        hue: tally.mean_hue(name),
        dark_ratio: tally.counts[ColorName::Dark.index()] as f32 / tally.samples as f32,
        samples: tally.samples,
    }
}
