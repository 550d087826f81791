use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Three components in the NED frame (or roll/pitch/yaw for attitude).
pub type Vec3 = [f64; 3];

/// Vehicle state in the NED frame.
///
/// Plain old data: fixed size, no pointers, no padding, so it can be copied
/// byte-for-byte into another process's view of a shared segment. This is the
/// 96-byte element of the state queue.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct State {
    /// `[N, E, D]` in meters.
    pub position: Vec3,
    /// `[N, E, D]` in m/s.
    pub velocity: Vec3,
    /// `[roll, pitch, yaw]` in degrees.
    pub attitude: Vec3,
    /// `[P, Q, R]` body rates in rad/s.
    pub angular_velocity: Vec3,
}

impl State {
    #[inline]
    pub fn new(position: Vec3, velocity: Vec3, attitude: Vec3, angular_velocity: Vec3) -> Self {
        Self {
            position,
            velocity,
            attitude,
            angular_velocity,
        }
    }

    /// Raw wire bytes of this record (96 bytes, native endianness).
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

fn fmt_vec3(f: &mut fmt::Formatter<'_>, label: &str, v: &Vec3) -> fmt::Result {
    writeln!(f, "{label}: [{}, {}, {}]", v[0], v[1], v[2])
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_vec3(f, "Position", &self.position)?;
        fmt_vec3(f, "Velocity", &self.velocity)?;
        fmt_vec3(f, "Attitude", &self.attitude)?;
        fmt_vec3(f, "Angular Velocity", &self.angular_velocity)
    }
}
