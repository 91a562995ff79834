//! Derivative-free minimization with the Nelder–Mead downhill simplex.
//!
//! The objective functions minimized in this crate (masked likelihoods, clipped residual sums)
//! are not guaranteed to be smooth, so no gradients are used.
//! Step coefficients, the initial simplex and the stopping rule follow the usual conventions
//! (e.g. `scipy.optimize.minimize(method="Nelder-Mead")`).

use itertools::Itertools;
use log::debug;
use nalgebra::DVector;

use crate::{Float, lit};

/// Outcome of a minimization.
#[derive(Clone, Debug, PartialEq)]
pub struct SimplexResult<F: Float> {
    /// Best vertex found.
    pub x: DVector<F>,
    /// Objective value at `x`.
    pub fun: F,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Number of objective evaluations.
    pub evaluations: usize,
    /// Whether the tolerances were reached before the iteration limit.
    pub converged: bool,
}

/// Nelder–Mead minimizer.
/// Use `with_` functions to set parameters.
#[derive(Clone, Debug)]
pub struct NelderMead<F: Float> {
    /// Maximum number of iterations; `None` means `200 * dimension`.
    max_iter: Option<usize>,
    /// Absolute tolerance on the vertex spread.
    xatol: F,
    /// Absolute tolerance on the objective spread.
    fatol: F,
    /// Coordinates in which the vertex spread is measured.
    spread_map: Option<fn(&DVector<F>) -> DVector<F>>,
}

impl<F: Float> Default for NelderMead<F> {
    fn default() -> Self {
        Self {
            max_iter: None,
            xatol: lit(1e-4),
            fatol: lit(1e-4),
            spread_map: None,
        }
    }
}

impl<F: Float> NelderMead<F> {
    /// Create a minimizer with default tolerances.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = Some(max_iter);
        self
    }

    /// Set the absolute tolerance on the simplex vertices.
    pub fn with_xatol(mut self, xatol: F) -> Self {
        self.xatol = xatol;
        self
    }

    /// Set the absolute tolerance on the objective values.
    pub fn with_fatol(mut self, fatol: F) -> Self {
        self.fatol = fatol;
        self
    }

    /// Measure the vertex spread on `map(x)` instead of `x`.
    ///
    /// For objectives over reparameterized coordinates, so that `xatol` applies to the
    /// bounded physical parameters rather than to coordinates running off to infinity.
    pub fn with_spread_map(mut self, map: fn(&DVector<F>) -> DVector<F>) -> Self {
        self.spread_map = Some(map);
        self
    }

    /// Minimize `objective` starting from `x0`.
    ///
    /// Non-finite objective values are treated as `+inf`, so such vertices are always replaced.
    pub fn minimize<O>(&self, mut objective: O, x0: &DVector<F>) -> SimplexResult<F>
    where
        O: FnMut(&DVector<F>) -> F,
    {
        let n = x0.len();
        let max_iter = self.max_iter.unwrap_or(200 * n.max(1));
        let (rho, chi, psi, sigma) = (F::one(), lit::<F>(2.), lit::<F>(0.5), lit::<F>(0.5));

        let mut evaluations = 0;
        let mut eval = |x: &DVector<F>| {
            evaluations += 1;
            let value = objective(x);
            if value.is_finite() {
                value
            } else {
                lit(f64::INFINITY)
            }
        };

        let mut simplex = Vec::with_capacity(n + 1);
        simplex.push(x0.clone());
        for k in 0..n {
            let mut vertex = x0.clone();
            vertex[k] = if vertex[k] != F::zero() {
                vertex[k] * lit(1.05)
            } else {
                lit(0.00025)
            };
            simplex.push(vertex);
        }
        let mut values = simplex.iter().map(&mut eval).collect_vec();

        let mut iterations = 0;
        let mut converged = false;
        while iterations < max_iter {
            sort_simplex(&mut simplex, &mut values);

            if self.is_converged(&simplex, &values) {
                converged = true;
                break;
            }
            iterations += 1;

            let centroid = simplex[..n]
                .iter()
                .fold(DVector::zeros(n), |acc, v| acc + v)
                / lit::<F>(n as f64);
            let worst = &simplex[n];

            let reflected = &centroid + (&centroid - worst) * rho;
            let f_reflected = eval(&reflected);

            if f_reflected < values[0] {
                let expanded = &centroid + (&reflected - &centroid) * chi;
                let f_expanded = eval(&expanded);
                if f_expanded < f_reflected {
                    simplex[n] = expanded;
                    values[n] = f_expanded;
                } else {
                    simplex[n] = reflected;
                    values[n] = f_reflected;
                }
                continue;
            }

            if f_reflected < values[n - 1] {
                simplex[n] = reflected;
                values[n] = f_reflected;
                continue;
            }

            // Contraction, outside or inside depending on the reflected value.
            let (contracted, f_contracted) = if f_reflected < values[n] {
                let c = &centroid + (&reflected - &centroid) * psi;
                let f = eval(&c);
                (c, f)
            } else {
                let c = &centroid + (worst - &centroid) * psi;
                let f = eval(&c);
                (c, f)
            };
            if f_contracted <= f_reflected.min(values[n]) {
                simplex[n] = contracted;
                values[n] = f_contracted;
                continue;
            }

            // Shrink towards the best vertex.
            let best = simplex[0].clone();
            for k in 1..=n {
                simplex[k] = &best + (&simplex[k] - &best) * sigma;
                values[k] = eval(&simplex[k]);
            }
        }
        sort_simplex(&mut simplex, &mut values);

        if !converged {
            debug!("Simplex stopped after {iterations} iterations without converging.");
        }

        SimplexResult {
            x: simplex.swap_remove(0),
            fun: values[0],
            iterations,
            evaluations,
            converged,
        }
    }

    fn is_converged(&self, simplex: &[DVector<F>], values: &[F]) -> bool {
        let x_spread = match self.spread_map {
            Some(map) => spread(&simplex.iter().map(map).collect_vec()),
            None => spread(simplex),
        };
        let f_spread = values[1..]
            .iter()
            .map(|f| (*f - values[0]).abs())
            .fold(F::zero(), |acc, x| acc.max(x));
        // Infinite spreads compare false against the tolerances.
        x_spread <= self.xatol && f_spread <= self.fatol
    }
}

/// Largest coordinate difference between the first vertex and any other.
fn spread<F: Float>(simplex: &[DVector<F>]) -> F {
    let best = &simplex[0];
    simplex[1..]
        .iter()
        .map(|v| (v - best).amax())
        .fold(F::zero(), |acc, x| acc.max(x))
}

fn sort_simplex<F: Float>(simplex: &mut Vec<DVector<F>>, values: &mut Vec<F>) {
    let (sorted_simplex, sorted_values): (Vec<_>, Vec<_>) = simplex
        .drain(..)
        .zip(values.drain(..))
        .sorted_by(|(_, f1), (_, f2)| f1.partial_cmp(f2).expect("objective values are not nan"))
        .unzip();
    *simplex = sorted_simplex;
    *values = sorted_values;
}
