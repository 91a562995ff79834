//! Minimal HEALPix support in the NESTED ordering scheme.
//!
//! Only what survey footprints need is implemented: mapping a sky position to its pixel
//! and finding the (up to eight) pixels bordering a pixel.
//! Pixel numbers follow the same conventions as `healpy` with `nest=True`.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};

const X_OFFSET: [i64; 8] = [-1, -1, 0, 1, 1, 1, 0, -1];
const Y_OFFSET: [i64; 8] = [0, 1, 1, 1, 0, -1, -1, -1];

// Base face of a neighbour when stepping off the current face,
// indexed by [direction][face]. Directions: S, SE, E, SW, center, NE, W, NW, N.
const FACE_ARRAY: [[i64; 12]; 9] = [
    [8, 9, 10, 11, -1, -1, -1, -1, 10, 11, 8, 9],
    [5, 6, 7, 4, 8, 9, 10, 11, 9, 10, 11, 8],
    [-1, -1, -1, -1, 5, 6, 7, 4, -1, -1, -1, -1],
    [4, 5, 6, 7, 11, 8, 9, 10, 11, 8, 9, 10],
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11],
    [1, 2, 3, 0, 0, 1, 2, 3, 5, 6, 7, 4],
    [-1, -1, -1, -1, 7, 4, 5, 6, -1, -1, -1, -1],
    [3, 0, 1, 2, 3, 0, 1, 2, 4, 5, 6, 7],
    [2, 3, 0, 1, -1, -1, -1, -1, 0, 1, 2, 3],
];

// Coordinate flips when crossing faces, indexed by [direction][face row].
// Bit 0 flips x, bit 1 flips y, bit 2 swaps x and y.
const SWAP_ARRAY: [[u8; 3]; 9] = [
    [0, 0, 3],
    [0, 0, 6],
    [0, 0, 0],
    [0, 0, 5],
    [0, 0, 0],
    [5, 0, 0],
    [0, 0, 0],
    [6, 0, 0],
    [3, 0, 0],
];

/// Whether `nside` is a valid resolution, i.e. a power of two.
pub fn is_valid_nside(nside: u32) -> bool {
    nside.is_power_of_two()
}

/// Total number of pixels at resolution `nside`.
pub fn npix(nside: u32) -> u64 {
    12 * u64::from(nside) * u64::from(nside)
}

/// Spread the lower 32 bits of `v` onto the even bits.
fn spread_bits(v: u64) -> u64 {
    let mut v = v & 0xffff_ffff;
    v = (v | (v << 16)) & 0x0000_ffff_0000_ffff;
    v = (v | (v << 8)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v << 2)) & 0x3333_3333_3333_3333;
    (v | (v << 1)) & 0x5555_5555_5555_5555
}

/// Inverse of [`spread_bits`].
fn compress_bits(v: u64) -> u64 {
    let mut v = v & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v >> 4)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v >> 8)) & 0x0000_ffff_0000_ffff;
    (v | (v >> 16)) & 0x0000_0000_ffff_ffff
}

fn xyf_to_nest(nside: u32, ix: u64, iy: u64, face: u64) -> u64 {
    face * u64::from(nside) * u64::from(nside) + spread_bits(ix) + (spread_bits(iy) << 1)
}

fn nest_to_xyf(nside: u32, pix: u64) -> (i64, i64, usize) {
    let npface = u64::from(nside) * u64::from(nside);
    let face = pix / npface;
    let local = pix % npface;
    (
        compress_bits(local) as i64,
        compress_bits(local >> 1) as i64,
        face as usize,
    )
}

/// Nested pixel index of the position `(ra, dec)` in degrees.
///
/// `nside` must be a power of two, see [`is_valid_nside`].
pub fn ang2pix_nest(nside: u32, ra: f64, dec: f64) -> u64 {
    let ns = i64::from(nside);
    let z = dec.to_radians().sin();
    let za = z.abs();
    let tt = ra.to_radians().rem_euclid(TAU) / FRAC_PI_2;

    let (face, ix, iy) = if za <= 2. / 3. {
        let temp1 = nside as f64 * (0.5 + tt);
        let temp2 = nside as f64 * z * 0.75;
        let jp = (temp1 - temp2) as i64;
        let jm = (temp1 + temp2) as i64;
        let ifp = jp / ns;
        let ifm = jm / ns;
        let face = if ifp == ifm {
            ifp | 4
        } else if ifp < ifm {
            ifp
        } else {
            ifm + 8
        };
        (face, jm & (ns - 1), ns - (jp & (ns - 1)) - 1)
    } else {
        let ntt = (tt as i64).min(3);
        let tp = tt - ntt as f64;
        let tmp = nside as f64 * (3. * (1. - za)).sqrt();
        let jp = ((tp * tmp) as i64).min(ns - 1);
        let jm = (((1. - tp) * tmp) as i64).min(ns - 1);
        if z >= 0. {
            (ntt, ns - jm - 1, ns - jp - 1)
        } else {
            (ntt + 8, jp, jm)
        }
    };

    xyf_to_nest(nside, ix as u64, iy as u64, face as u64)
}

/// Center `(ra, dec)` in degrees of a nested pixel.
pub fn pix2ang_nest(nside: u32, pix: u64) -> (f64, f64) {
    const JRLL: [i64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
    const JPLL: [i64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

    let ns = i64::from(nside);
    let (ix, iy, face) = nest_to_xyf(nside, pix);
    let jr = JRLL[face] * ns - ix - iy - 1;

    let (nr, z) = if jr < ns {
        (jr, 1. - (jr * jr) as f64 / (3. * (ns * ns) as f64))
    } else if jr > 3 * ns {
        let nr = 4 * ns - jr;
        (nr, (nr * nr) as f64 / (3. * (ns * ns) as f64) - 1.)
    } else {
        (ns, (2 * ns - jr) as f64 * 2. / (3 * ns) as f64)
    };

    let mut tmp = JPLL[face] * nr + ix - iy;
    if tmp < 0 {
        tmp += 8 * nr;
    }
    let phi = FRAC_PI_4 * tmp as f64 / nr as f64;
    let dec = 90. - z.clamp(-1., 1.).acos().to_degrees();
    (phi.to_degrees().rem_euclid(360.), dec)
}

/// The eight neighbours of a nested pixel, in the order SW, W, NW, N, NE, E, SE, S.
///
/// Pixels at the corners of the twelve base faces have only seven neighbours;
/// the missing one is `None`.
pub fn neighbours_nest(nside: u32, pix: u64) -> [Option<u64>; 8] {
    let ns = i64::from(nside);
    let (ix, iy, face) = nest_to_xyf(nside, pix);
    let mut result = [None; 8];

    if ix > 0 && ix < ns - 1 && iy > 0 && iy < ns - 1 {
        for (m, out) in result.iter_mut().enumerate() {
            let x = (ix + X_OFFSET[m]) as u64;
            let y = (iy + Y_OFFSET[m]) as u64;
            *out = Some(xyf_to_nest(nside, x, y, face as u64));
        }
        return result;
    }

    for (m, out) in result.iter_mut().enumerate() {
        let mut x = ix + X_OFFSET[m];
        let mut y = iy + Y_OFFSET[m];
        let mut nbnum = 4;
        if x < 0 {
            x += ns;
            nbnum -= 1;
        } else if x >= ns {
            x -= ns;
            nbnum += 1;
        }
        if y < 0 {
            y += ns;
            nbnum -= 3;
        } else if y >= ns {
            y -= ns;
            nbnum += 3;
        }

        let f = FACE_ARRAY[nbnum][face];
        if f < 0 {
            continue;
        }
        let bits = SWAP_ARRAY[nbnum][face >> 2];
        if bits & 1 != 0 {
            x = ns - x - 1;
        }
        if bits & 2 != 0 {
            y = ns - y - 1;
        }
        if bits & 4 != 0 {
            std::mem::swap(&mut x, &mut y);
        }
        *out = Some(xyf_to_nest(nside, x as u64, y as u64, f as u64));
    }

    result
}

/// Approximate pixel size in degrees.
pub fn pixel_resolution(nside: u32) -> f64 {
    (4. * PI / npix(nside) as f64).sqrt().to_degrees()
}
