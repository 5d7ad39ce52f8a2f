//! Synthetic point clouds in the sensor's wire format.

use rand::Rng;
use serde::Serialize;
use std::f32::consts::PI;

#[derive(Debug, Serialize)]
pub struct Payload {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<[f32; 3]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<[f32; 3]>>,
}

impl Payload {
    /// What the sensor answers before its first capture.
    pub fn no_data() -> Self {
        Self {
            status: "no data",
            points: None,
            colors: None,
        }
    }
}

/// Parameters of the generated shape.
#[derive(Debug, Clone, Copy)]
pub struct CloudShape {
    pub points: usize,
    pub radius: f32,
    /// Radial noise amplitude, in world units.
    pub noise: f32,
    /// Rotation speed about the vertical axis, radians per second.
    pub spin: f32,
}

/// Fibonacci-sphere shell rotated by `spin * t_secs`, colored by direction.
pub fn generate<R: Rng>(shape: &CloudShape, t_secs: f32, rng: &mut R) -> Payload {
    let n = shape.points;
    let golden = PI * (3.0 - 5f32.sqrt());
    let (sin_a, cos_a) = (shape.spin * t_secs).sin_cos();

    let mut points = Vec::with_capacity(n);
    let mut colors = Vec::with_capacity(n);

    for i in 0..n {
        let y = if n > 1 { 1.0 - 2.0 * i as f32 / (n - 1) as f32 } else { 0.0 };
        let ring = (1.0 - y * y).max(0.0).sqrt();
        let theta = golden * i as f32;
        let dir = [ring * theta.cos(), y, ring * theta.sin()];

        let r = shape.radius
            + if shape.noise > 0.0 {
                rng.gen_range(-shape.noise..=shape.noise)
            } else {
                0.0
            };
        let (x, z) = (dir[0] * r, dir[2] * r);
        points.push([x * cos_a - z * sin_a, dir[1] * r, x * sin_a + z * cos_a]);
        colors.push([
            dir[0] * 0.5 + 0.5,
            dir[1] * 0.5 + 0.5,
            dir[2] * 0.5 + 0.5,
        ]);
    }

    Payload {
        status: "success",
        points: Some(points),
        colors: Some(colors),
    }
}
