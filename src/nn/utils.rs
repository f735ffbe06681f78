use anyhow::{Error, Result};
use ndarray as nd;
use nd::{prelude::*, Zip};
use ndarray_rand::RandomExt;
use num::Float;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};


/// Step and tolerances for `grad_check`. Two entries agree when
/// `|analytic - numeric| <= atol + rtol * |numeric|`.
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    pub epsilon: f64,
    pub atol: f64,
    pub rtol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { epsilon: 1e-6, atol: 1e-5, rtol: 1e-3 }
    }
}

/// Central differences of `f` around `x`, one row per input coordinate:
/// `jac[[i, j]] = d f_j / d x_i`.
fn numeric_jacobian(x: &Array1<f64>, f: impl Fn(&Array1<f64>) -> Array1<f64>, epsilon: f64) -> Array2<f64> {
    let m = f(x).len();
    let mut jac = Array2::<f64>::zeros((x.len(), m));
    let mut shifted = x.clone();
    for (i, mut row) in jac.outer_iter_mut().enumerate() {
        shifted[i] = x[i] + epsilon;
        let up = f(&shifted);
        shifted[i] = x[i] - epsilon;
        let down = f(&shifted);
        shifted[i] = x[i];
        Zip::from(&mut row).and(&up).and(&down)
            .for_each(|r, &u, &d| *r = (u - d) / (2.0 * epsilon));
    }
    jac
}

/// Compares a hand written backward `df` against finite differences of `f`.
/// `f` maps R^n to R^m, `df` maps an upstream gradient in R^m back to R^n;
/// both have to be pure. Every output coordinate is checked by feeding `df`
/// the matching unit vector.
pub fn grad_check(
    x: Array1<f64>,
    f: impl Fn(&Array1<f64>) -> Array1<f64>,
    df: impl Fn(&Array1<f64>) -> Array1<f64>,
    tol: Tolerance,
) -> Result<()> {
    let jac = numeric_jacobian(&x, &f, tol.epsilon);
    let (n, m) = jac.dim();

    let mut unit = Array1::<f64>::zeros(m);
    for j in 0..m {
        unit[j] = 1.0;
        let analytic = df(&unit);
        unit[j] = 0.0;
        if analytic.len() != n {
            return Err(Error::msg(format!("backward returned {} entries for an input of {n}", analytic.len())));
        }
        let numeric = jac.column(j);
        let worst = Zip::from(&analytic).and(&numeric)
            .fold(0.0f64, |w, &a, &b| w.max((a - b).abs() - (tol.atol + tol.rtol * b.abs())));
        if worst > 0.0 {
            return Err(Error::msg(format!(
                "gradient of output {j} is off by {worst:e} past tolerance\n numeric: {numeric}\n analytic: {analytic}"
            )));
        }
    }
    Ok(())
}

/// Standard normal samples from a fixed seed.
pub fn randn_seeded<T, D, Sh>(shape: Sh, seed: u64) -> Array<T, D>
where
    D: Dimension,
    Sh: ShapeBuilder<Dim = D>,
    StandardNormal: Distribution<T>,
{
    let mut rng = StdRng::seed_from_u64(seed);
    Array::random_using(shape, StandardNormal, &mut rng)
}

/// Scales every row to unit L2 norm, the way feature projections are fed to
/// the contrastive loss. All-zero rows are left alone.
pub fn l2_normalize_rows<A: Float + 'static>(x: &ArrayView2<A>) -> Array2<A> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let norm = row.iter().fold(A::zero(), |acc, v| acc + *v * *v).sqrt();
        if norm > A::zero() {
            row.mapv_inplace(|v| v / norm);
        }
    }
    out
}

pub fn isclose<D: Dimension, A: Float>(a: &Array<A, D>, b: &Array<A, D>) -> bool {
    let rtol = A::from(1e-5).unwrap();
    let atol = A::from(1e-8).unwrap();
    a.shape() == b.shape() && a.iter().zip(b.iter()).all(|(i, j)| (*i - *j).abs() <= atol + rtol * j.abs())
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_jacobian_linear() {
        let x = randn_seeded::<f64, _, _>(7, 0);
        let jac = numeric_jacobian(&x, |x| x * 3.0, 1e-4);
        let analytical = Array2::from_diag(&Array1::from_elem(7, 3.0));
        for (a, b) in jac.iter().zip(analytical.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_gradcheck_pointwise() {
        let x = randn_seeded::<f64, _, _>(16, 1);
        let x0 = x.clone();
        let f = |x: &Array1<f64>| x.mapv(|v| 3.0 * v + v.sin() * v.exp());
        let df = move |g: &Array1<f64>| {
            g * &x0.mapv(|v| 3.0 + (v.cos() + v.sin()) * v.exp())
        };
        grad_check(x, f, df, Tolerance::default()).unwrap();
    }

    #[test]
    fn test_gradcheck_catches_wrong_grad() {
        let x = randn_seeded::<f64, _, _>(4, 2);
        let f = |x: &Array1<f64>| x * 2.0;
        let df = |g: &Array1<f64>| g * 3.0;
        assert!(grad_check(x, f, df, Tolerance::default()).is_err());
    }

    #[test]
    fn test_gradcheck_tolerance() {
        let x = randn_seeded::<f64, _, _>(5, 3);
        let f = |x: &Array1<f64>| x * 2.0;
        let df = |g: &Array1<f64>| g * 2.01;
        assert!(grad_check(x.clone(), f, df, Tolerance::default()).is_err());
        let loose = Tolerance { rtol: 1e-2, ..Tolerance::default() };
        grad_check(x.clone(), f, df, loose).unwrap();

        let short = |g: &Array1<f64>| g.slice(s![..4]).to_owned() * 2.0;
        assert!(grad_check(x, f, short, loose).is_err());
    }

    #[test]
    fn seeded_randn_repeats() {
        let a = randn_seeded::<f32, _, _>((3, 4), 42);
        let b = randn_seeded::<f32, _, _>((3, 4), 42);
        let c = randn_seeded::<f32, _, _>((3, 4), 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rows_have_unit_norm() {
        let x = array![[3.0f64, 4.0], [0.0, 0.0]];
        let y = l2_normalize_rows(&x.view());
        assert!(isclose(&y, &array![[0.6, 0.8], [0.0, 0.0]]));
    }
}
