//! Planar SLAM fixtures: SE(2) poses, 2-D landmarks, and the factor types
//! the end-to-end scenarios use, implemented as consumers of the engine's
//! public surface. Jacobians are computed by central differences so the
//! linearization is consistent with the retract maps by construction.

#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;

use nalgebra::{dvector, DMatrix, DVector};

use tinysam::{
    eliminate_sequential, DiagonalNoise, Error, Factor, JacobianFactor, Key, LinearFactor,
    Ordering, Smoother, Symbol, Value, Values, VarIndex,
};

pub const TOL: f64 = 1e-4;

/// Opt-in log output for debugging a test run: `RUST_LOG=tinysam=trace`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn pose_key(i: u64) -> Key {
    Symbol::new('x', i).key()
}

pub fn landmark_key(j: u64) -> Key {
    Symbol::new('l', j).key()
}

pub fn wrap_angle(theta: f64) -> f64 {
    let mut w = theta % (2.0 * std::f64::consts::PI);
    if w > std::f64::consts::PI {
        w -= 2.0 * std::f64::consts::PI;
    } else if w <= -std::f64::consts::PI {
        w += 2.0 * std::f64::consts::PI;
    }
    w
}

// ---------------------------------------------------------------------------
// Manifold values
// ---------------------------------------------------------------------------

/// A 2-D landmark; retract is plain addition.
#[derive(Clone, Debug, PartialEq)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Value for Point2 {
    fn dim(&self) -> usize {
        2
    }
    fn retract(&self, delta: &DVector<f64>) -> Box<dyn Value> {
        Box::new(Point2::new(self.x + delta[0], self.y + delta[1]))
    }
    fn local_coordinates(&self, other: &dyn Value) -> DVector<f64> {
        let o = other.as_any().downcast_ref::<Point2>().expect("Point2");
        dvector![o.x - self.x, o.y - self.y]
    }
    fn boxed_clone(&self) -> Box<dyn Value> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An SE(2) pose; retract composes with the exponential map of the
/// tangent vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Pose2 {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose2 {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    pub fn compose(&self, other: &Pose2) -> Pose2 {
        let (s, c) = self.theta.sin_cos();
        Pose2::new(
            self.x + c * other.x - s * other.y,
            self.y + s * other.x + c * other.y,
            wrap_angle(self.theta + other.theta),
        )
    }

    pub fn inverse(&self) -> Pose2 {
        let (s, c) = self.theta.sin_cos();
        Pose2::new(
            -(c * self.x + s * self.y),
            -(-s * self.x + c * self.y),
            wrap_angle(-self.theta),
        )
    }

    pub fn between(&self, other: &Pose2) -> Pose2 {
        self.inverse().compose(other)
    }

    pub fn expmap(delta: &DVector<f64>) -> Pose2 {
        let (dx, dy, w) = (delta[0], delta[1], delta[2]);
        if w.abs() < 1e-10 {
            return Pose2::new(dx, dy, w);
        }
        let (s, c) = w.sin_cos();
        let a = s / w;
        let b = (1.0 - c) / w;
        Pose2::new(a * dx - b * dy, b * dx + a * dy, wrap_angle(w))
    }

    pub fn logmap(&self) -> DVector<f64> {
        let w = wrap_angle(self.theta);
        if w.abs() < 1e-10 {
            return dvector![self.x, self.y, w];
        }
        let (s, c) = w.sin_cos();
        let a = s / w;
        let b = (1.0 - c) / w;
        let det = a * a + b * b;
        dvector![
            (a * self.x + b * self.y) / det,
            (-b * self.x + a * self.y) / det,
            w
        ]
    }
}

impl Value for Pose2 {
    fn dim(&self) -> usize {
        3
    }
    fn retract(&self, delta: &DVector<f64>) -> Box<dyn Value> {
        Box::new(self.compose(&Pose2::expmap(delta)))
    }
    fn local_coordinates(&self, other: &dyn Value) -> DVector<f64> {
        let o = other.as_any().downcast_ref::<Pose2>().expect("Pose2");
        self.between(o).logmap()
    }
    fn boxed_clone(&self) -> Box<dyn Value> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Numerical linearization
// ---------------------------------------------------------------------------

fn numerical_jacobian<F>(residual: &F, values: &Values, key: Key, rows: usize) -> DMatrix<f64>
where
    F: Fn(&Values) -> DVector<f64>,
{
    let dim = values.dim_of(key).expect("known key");
    let mut jac = DMatrix::zeros(rows, dim);
    let h = 1e-6;
    for j in 0..dim {
        let mut step = DVector::zeros(dim);
        step[j] = h;
        let mut plus = values.clone();
        plus.retract_key_in_place(key, &step);
        step[j] = -h;
        let mut minus = values.clone();
        minus.retract_key_in_place(key, &step);
        jac.set_column(j, &((residual(&plus) - residual(&minus)) / (2.0 * h)));
    }
    jac
}

fn linearize_numeric<F>(
    keys: &[Key],
    noise: &DiagonalNoise,
    residual: &F,
    values: &Values,
    ordering: &Ordering,
) -> Result<JacobianFactor, Error>
where
    F: Fn(&Values) -> DVector<f64>,
{
    let r = residual(values);
    let mut indices = Vec::with_capacity(keys.len());
    let mut blocks = Vec::with_capacity(keys.len());
    for &key in keys {
        let index = ordering.index_of(key).ok_or(Error::DuplicateKey { key })?;
        let mut jac = numerical_jacobian(residual, values, key, r.len());
        noise.whiten_matrix_in_place(&mut jac);
        indices.push(index);
        blocks.push(jac);
    }
    Ok(JacobianFactor::new(indices, blocks, -noise.whiten_vector(&r)))
}

// ---------------------------------------------------------------------------
// Factors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PriorFactor {
    keys: [Key; 1],
    prior: Pose2,
    noise: DiagonalNoise,
}

impl PriorFactor {
    pub fn new(key: Key, prior: Pose2, noise: DiagonalNoise) -> Arc<dyn Factor> {
        Arc::new(Self { keys: [key], prior, noise })
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let x = values.at::<Pose2>(self.keys[0]).expect("pose present");
        self.prior.local_coordinates(x)
    }
}

impl Factor for PriorFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }
    fn dim(&self) -> usize {
        3
    }
    fn error(&self, values: &Values) -> f64 {
        self.noise.quadratic_error(&self.residual(values))
    }
    fn linearize(&self, values: &Values, ordering: &Ordering) -> Result<JacobianFactor, Error> {
        linearize_numeric(&self.keys, &self.noise, &|v| self.residual(v), values, ordering)
    }
}

#[derive(Debug)]
pub struct BetweenFactor {
    keys: [Key; 2],
    measured: Pose2,
    noise: DiagonalNoise,
}

impl BetweenFactor {
    pub fn new(from: Key, to: Key, measured: Pose2, noise: DiagonalNoise) -> Arc<dyn Factor> {
        Arc::new(Self { keys: [from, to], measured, noise })
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let a = values.at::<Pose2>(self.keys[0]).expect("pose present");
        let b = values.at::<Pose2>(self.keys[1]).expect("pose present");
        self.measured.local_coordinates(&a.between(b))
    }
}

impl Factor for BetweenFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }
    fn dim(&self) -> usize {
        3
    }
    fn error(&self, values: &Values) -> f64 {
        self.noise.quadratic_error(&self.residual(values))
    }
    fn linearize(&self, values: &Values, ordering: &Ordering) -> Result<JacobianFactor, Error> {
        linearize_numeric(&self.keys, &self.noise, &|v| self.residual(v), values, ordering)
    }
}

#[derive(Debug)]
pub struct BearingRangeFactor {
    keys: [Key; 2],
    bearing: f64,
    range: f64,
    noise: DiagonalNoise,
}

impl BearingRangeFactor {
    pub fn new(
        pose: Key,
        landmark: Key,
        bearing: f64,
        range: f64,
        noise: DiagonalNoise,
    ) -> Arc<dyn Factor> {
        Arc::new(Self { keys: [pose, landmark], bearing, range, noise })
    }

    fn residual(&self, values: &Values) -> DVector<f64> {
        let pose = values.at::<Pose2>(self.keys[0]).expect("pose present");
        let point = values.at::<Point2>(self.keys[1]).expect("landmark present");
        let (s, c) = pose.theta.sin_cos();
        let dx = point.x - pose.x;
        let dy = point.y - pose.y;
        // landmark in the pose frame
        let lx = c * dx + s * dy;
        let ly = -s * dx + c * dy;
        dvector![
            wrap_angle(ly.atan2(lx) - self.bearing),
            (lx * lx + ly * ly).sqrt() - self.range
        ]
    }
}

impl Factor for BearingRangeFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }
    fn dim(&self) -> usize {
        2
    }
    fn error(&self, values: &Values) -> f64 {
        self.noise.quadratic_error(&self.residual(values))
    }
    fn linearize(&self, values: &Values, ordering: &Ordering) -> Result<JacobianFactor, Error> {
        linearize_numeric(&self.keys, &self.noise, &|v| self.residual(v), values, ordering)
    }
}

// ---------------------------------------------------------------------------
// Batch reference
// ---------------------------------------------------------------------------

/// One-shot reference: linearize every live factor at the engine's own
/// linearization point under its current ordering, eliminate in one pass,
/// back-substitute, and retract once.
pub fn batch_estimate(isam: &Smoother) -> Values {
    let ordering = isam.ordering();
    let theta = isam.linearization_point();
    let n = ordering.len();
    let linear: Vec<LinearFactor> = isam
        .factors_unsafe()
        .iter_live()
        .map(|(_, f)| LinearFactor::Jacobian(f.linearize(theta, ordering).expect("linearize")))
        .collect();
    let order: Vec<VarIndex> = (0..n).map(VarIndex).collect();
    let dims: Vec<usize> = order
        .iter()
        .map(|&i| theta.dim_of(ordering.key_of(i).expect("index")).expect("dim"))
        .collect();
    let fragment = eliminate_sequential(
        linear,
        &order,
        |v| dims[v.as_usize()],
        isam.params().factorization,
    )
    .expect("batch elimination");

    let mut x: Vec<DVector<f64>> = dims.iter().map(|&d| DVector::zeros(d)).collect();
    for cond in fragment.conditionals.iter().rev() {
        let sol = cond.solve(|k| x[k.as_usize()].clone());
        let mut off = 0;
        for (pos, &f) in cond.frontals().iter().enumerate() {
            let w = cond.dims()[pos];
            x[f.as_usize()] = sol.rows(off, w).into_owned();
            off += w;
        }
    }

    let mut out = Values::new();
    for (key, value) in theta.iter() {
        let index = ordering.index_of(key).expect("key");
        out.insert(key, value.retract(&x[index.as_usize()])).expect("fresh map");
    }
    out
}

/// Manifold-aware comparison: the local coordinates between the two
/// estimates must vanish (L∞) for every key.
pub fn assert_estimates_close(actual: &Values, expected: &Values, tol: f64) {
    assert_eq!(actual.len(), expected.len(), "estimate sizes differ");
    for (key, value) in expected.iter() {
        let got = actual.at_dyn(key).unwrap_or_else(|| panic!("{key:?} missing"));
        let diff = value.local_coordinates(got);
        let gap = diff.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        assert!(gap < tol, "{key:?} differs by {gap} (tol {tol})");
    }
}

/// The Bayes-tree/elimination equivalence invariant.
pub fn check_matches_batch(isam: &Smoother) {
    assert_estimates_close(&isam.calculate_estimate(), &batch_estimate(isam), TOL);
}

// ---------------------------------------------------------------------------
// The shared trajectory: 12 poses, two landmarks
// ---------------------------------------------------------------------------

use std::f64::consts::PI;

pub fn odo_noise() -> DiagonalNoise {
    DiagonalNoise::from_sigmas(&[0.1, 0.1, PI / 100.0])
}

pub fn br_noise() -> DiagonalNoise {
    DiagonalNoise::from_sigmas(&[PI / 100.0, 0.1])
}

pub fn prior_noise() -> DiagonalNoise {
    DiagonalNoise::from_sigmas(&[0.1, 0.1, PI / 100.0])
}

/// Initial guesses perturbed by roughly a decimeter from the straight
/// ground-truth trajectory.
pub fn pose_guess(i: u64) -> Pose2 {
    let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
    Pose2::new(
        i as f64 + 0.05 * sign,
        -0.04 + 0.02 * ((i % 3) as f64),
        0.01 * sign,
    )
}

/// The re-observation of L100 from the last pose.
pub fn second_l100_factor(range: f64) -> Arc<dyn Factor> {
    BearingRangeFactor::new(
        pose_key(11),
        landmark_key(100),
        PI / 4.0 + PI / 16.0,
        range,
        br_noise(),
    )
}

/// The graph and fresh values for incremental step `i`. Step 6 sights the
/// two landmarks, step 11 sights them again with shifted angles and a
/// shorter range; `second_l100` gates the re-observation of L100.
pub fn step_update(i: u64, second_l100: bool) -> (Vec<Arc<dyn Factor>>, Values) {
    let mut graph: Vec<Arc<dyn Factor>> = Vec::new();
    let mut values = Values::new();
    if i == 0 {
        graph.push(PriorFactor::new(pose_key(0), Pose2::new(0.0, 0.0, 0.0), prior_noise()));
        values.insert(pose_key(0), Box::new(pose_guess(0))).unwrap();
    } else {
        graph.push(BetweenFactor::new(
            pose_key(i - 1),
            pose_key(i),
            Pose2::new(1.0, 0.0, 0.0),
            odo_noise(),
        ));
        values.insert(pose_key(i), Box::new(pose_guess(i))).unwrap();
    }
    if i == 6 {
        graph.push(BearingRangeFactor::new(
            pose_key(6),
            landmark_key(100),
            PI / 4.0,
            5.0,
            br_noise(),
        ));
        graph.push(BearingRangeFactor::new(
            pose_key(6),
            landmark_key(101),
            -PI / 4.0,
            5.0,
            br_noise(),
        ));
        values
            .insert(landmark_key(100), Box::new(Point2::new(9.6, 3.6)))
            .unwrap();
        values
            .insert(landmark_key(101), Box::new(Point2::new(9.4, -3.4)))
            .unwrap();
    }
    if i == 11 {
        if second_l100 {
            graph.push(second_l100_factor(4.5));
        }
        graph.push(BearingRangeFactor::new(
            pose_key(11),
            landmark_key(101),
            -PI / 4.0 - PI / 16.0,
            4.5,
            br_noise(),
        ));
    }
    (graph, values)
}

/// Let the engine iterate to convergence through empty updates: each one
/// relinearizes whatever moved and re-solves.
pub fn settle(isam: &mut Smoother, rounds: usize) {
    for _ in 0..rounds {
        isam.update_simple(Vec::new(), Values::new()).unwrap();
    }
}
