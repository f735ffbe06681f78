use ndarray as nd;
use nd::{prelude::*, NdFloat, Zip};
use thiserror::Error;

use crate::configs::NceOptions;

/// Value written over self similarities, exp(-10) is close enough to zero.
pub const DIAGONAL_FILL: f64 = -10.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NceError {
    #[error("query features have shape {query:?} but key features have shape {key:?}")]
    ShapeMismatch { query: (usize, usize), key: (usize, usize) },
    #[error("{patches} patches cannot be split into {groups} groups")]
    IndivisibleBatch { patches: usize, groups: usize },
    #[error("mask has {mask} entries for {patches} patches")]
    MaskLength { mask: usize, patches: usize },
}

fn cast<T: NdFloat>(x: f64) -> T {
    T::from(x).expect("float constants are representable in every float type")
}

/// [N, D] x [N, D] -> [N], the similarity of each query with its own key.
pub fn positive_logits<T: NdFloat>(feat_q: &ArrayView2<T>, feat_k: &ArrayView2<T>) -> Array1<T> {
    let mut out = Array1::zeros(feat_q.nrows());
    Zip::from(&mut out)
        .and(feat_q.rows())
        .and(feat_k.rows())
        .for_each(|o, q, k| *o = q.dot(&k));
    out
}

/// [N, D] x [N, D] -> [G, P, P] with N = G * P, the similarity of every query
/// with every key of the same group.
pub fn negative_logits<T: NdFloat>(feat_q: &ArrayView2<T>, feat_k: &ArrayView2<T>, groups: usize) -> Array3<T> {
    let patches = feat_q.nrows() / groups;
    let mut out = Array3::zeros((groups, patches, patches));
    for (g, mut sim) in out.outer_iter_mut().enumerate() {
        let q = feat_q.slice(s![g * patches..(g + 1) * patches, ..]);
        let k = feat_k.slice(s![g * patches..(g + 1) * patches, ..]);
        nd::linalg::general_mat_mul(T::one(), &q, &k.t(), T::zero(), &mut sim);
    }
    out
}

/// A patch is never its own negative.
pub fn suppress_diagonal<T: NdFloat>(neg: &mut Array3<T>) {
    let fill = cast(DIAGONAL_FILL);
    for mut sim in neg.outer_iter_mut() {
        sim.diag_mut().fill(fill);
    }
}

/// [N] and [G, P, P] -> [N, 1 + P], the positive in column 0, divided by the
/// temperature.
pub fn assemble_logits<T: NdFloat>(pos: &Array1<T>, neg: &Array3<T>, nce_t: T) -> Array2<T> {
    let (groups, patches, _) = neg.dim();
    let mut out = Array2::zeros((groups * patches, 1 + patches));
    out.column_mut(0).assign(pos);
    for (g, sim) in neg.outer_iter().enumerate() {
        out.slice_mut(s![g * patches..(g + 1) * patches, 1..]).assign(&sim);
    }
    out.mapv_inplace(|x| x / nce_t);
    out
}

/// Row wise log softmax, shifted by the row max. The max term is kept out of
/// the sum and added back with `ln_1p`, so a row whose max is far ahead of the
/// rest still gets a nonzero log probability for every other entry.
pub fn log_softmax_rows<T: NdFloat>(logits: &ArrayView2<T>) -> Array2<T> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let (argmax, max) = row.iter().enumerate()
            .fold((0, T::neg_infinity()), |(i, m), (j, &x)| if x > m { (j, x) } else { (i, m) });
        let rest = row.iter().enumerate()
            .filter(|(j, _)| *j != argmax)
            .fold(T::zero(), |acc, (_, &x)| acc + (x - max).exp());
        let log_sum = rest.ln_1p();
        row.mapv_inplace(|x| x - max - log_sum);
    }
    out
}

/// `mask * 9 + 1`: 0 keeps weight 1, 1 weighs a patch ten times. Values
/// outside [0, 1] go through the same formula unchanged.
pub fn mask_weights<T: NdFloat>(mask: &ArrayView1<T>) -> Array1<T> {
    let nine = cast::<T>(9.0);
    mask.mapv(|m| m * nine + T::one())
}

/// What the backward pass needs from the forward pass. The keys are kept as a
/// detached copy, no gradient is ever produced for them.
pub struct PatchNceCtx<T> {
    feat_k: Array2<T>,
    probs: Array2<T>,
    weights: Array1<T>,
    groups: usize,
}

/// Contrastive loss between query patches and key patches: each query is
/// pulled towards the key at the same location and pushed away from the other
/// keys of its group.
///
/// Negatives come from the same image only (`batch_size` groups), unless
/// `nce_includes_all_negatives_from_minibatch` is set, in which case the whole
/// minibatch is a single group. The latter suits single image translation,
/// where every crop comes from the same picture.
#[derive(Debug, Clone)]
pub struct PatchNceLoss {
    nce_t: f64,
    all_negatives_from_minibatch: bool,
    batch_size: usize,
}

impl PatchNceLoss {
    pub fn new(opts: &NceOptions) -> Self {
        Self {
            nce_t: opts.nce_t,
            all_negatives_from_minibatch: opts.nce_includes_all_negatives_from_minibatch,
            batch_size: opts.batch_size,
        }
    }

    pub fn groups(&self) -> usize {
        if self.all_negatives_from_minibatch { 1 } else { self.batch_size }
    }

    fn check<T>(&self, feat_q: &ArrayView2<T>, feat_k: &ArrayView2<T>, mask: Option<&ArrayView1<T>>) -> Result<usize, NceError> {
        if feat_q.dim() != feat_k.dim() {
            return Err(NceError::ShapeMismatch { query: feat_q.dim(), key: feat_k.dim() });
        }
        let patches = feat_q.nrows();
        let groups = self.groups();
        if groups == 0 || patches % groups != 0 {
            return Err(NceError::IndivisibleBatch { patches, groups });
        }
        if let Some(mask) = mask {
            if mask.len() != patches {
                return Err(NceError::MaskLength { mask: mask.len(), patches });
            }
        }
        Ok(groups)
    }

    /// Logits of shape [N, 1 + P], the positive first.
    pub fn logits<T: NdFloat>(&self, feat_q: &ArrayView2<T>, feat_k: &ArrayView2<T>) -> Result<Array2<T>, NceError> {
        let groups = self.check(feat_q, feat_k, None)?;
        Ok(self.grouped_logits(feat_q, feat_k, groups))
    }

    fn grouped_logits<T: NdFloat>(&self, feat_q: &ArrayView2<T>, feat_k: &ArrayView2<T>, groups: usize) -> Array2<T> {
        let pos = positive_logits(feat_q, feat_k);
        let mut neg = negative_logits(feat_q, feat_k, groups);
        suppress_diagonal(&mut neg);
        assemble_logits(&pos, &neg, cast(self.nce_t))
    }

    /// Per patch loss of shape [N], no reduction. Without a mask this is the
    /// cross entropy against class 0; with one, the same term scaled by
    /// `mask_weights`.
    pub fn forward<T: NdFloat>(
        &self,
        feat_q: &ArrayView2<T>,
        feat_k: &ArrayView2<T>,
        mask: Option<&ArrayView1<T>>,
    ) -> Result<(Array1<T>, PatchNceCtx<T>), NceError> {
        let groups = self.check(feat_q, feat_k, mask)?;
        let logits = self.grouped_logits(feat_q, feat_k, groups);
        let log_probs = log_softmax_rows(&logits.view());

        let weights = match mask {
            Some(mask) => mask_weights(mask),
            None => Array1::ones(feat_q.nrows()),
        };
        let loss = Zip::from(log_probs.column(0)).and(&weights).map_collect(|&lp, &w| -lp * w);

        let ctx = PatchNceCtx {
            feat_k: feat_k.to_owned(),
            probs: log_probs.mapv_into(|x| x.exp()),
            weights,
            groups,
        };
        Ok((loss, ctx))
    }

    pub fn loss<T: NdFloat>(&self, feat_q: &ArrayView2<T>, feat_k: &ArrayView2<T>, mask: Option<&ArrayView1<T>>) -> Result<Array1<T>, NceError> {
        self.forward(feat_q, feat_k, mask).map(|(loss, _)| loss)
    }

    /// Gradient of `sum(grad * loss)` with respect to the queries, shape [N, D].
    pub fn backward<T: NdFloat>(&self, ctx: &PatchNceCtx<T>, grad: &ArrayView1<T>) -> Array2<T> {
        let inv_t = T::one() / cast::<T>(self.nce_t);
        let n = ctx.probs.nrows();
        let patches = n / ctx.groups;

        // d loss / d logits = w * (softmax - onehot(0)), then through the 1/T
        let mut dlogits = ctx.probs.clone();
        dlogits.column_mut(0).mapv_inplace(|p| p - T::one());
        for (mut row, (&g, &w)) in dlogits.rows_mut().into_iter().zip(grad.iter().zip(ctx.weights.iter())) {
            let scale = g * w * inv_t;
            row.mapv_inplace(|x| x * scale);
        }

        let mut dq = Array2::zeros((n, ctx.feat_k.ncols()));
        Zip::from(dq.rows_mut())
            .and(dlogits.column(0))
            .and(ctx.feat_k.rows())
            .for_each(|mut row, &d, k| row.scaled_add(d, &k));

        for g in 0..ctx.groups {
            let (start, end) = (g * patches, (g + 1) * patches);
            let mut dneg = dlogits.slice(s![start..end, 1..]).to_owned();
            // the filled diagonal is a constant
            dneg.diag_mut().fill(T::zero());
            let k = ctx.feat_k.slice(s![start..end, ..]);
            let mut dq_g = dq.slice_mut(s![start..end, ..]);
            nd::linalg::general_mat_mul(T::one(), &dneg, &k, T::one(), &mut dq_g);
        }
        dq
    }
}
