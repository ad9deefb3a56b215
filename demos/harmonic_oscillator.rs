//! Adjoint sensitivity of a harmonic oscillator to its frequency.
//!
//! Integrates y'' + ω²y = 0 forward, then the adjoint backward, and compares
//! d y(T) / dω with the exact value -T sin(ωT).
//!
//! Run with:
//!   cargo run --example harmonic_oscillator

use rkf78_adjoint::{
    AdjointConfig, AdjointSession, AdjointSystem, InterpolationKind, OdeSystem, RhsError, Rkf78,
    Task, Tolerances,
};

/// Simple harmonic oscillator: y'' + ω²y = 0
///
/// State vector: [y, y']
struct HarmonicOscillator {
    omega: f64,
}

impl OdeSystem<[f64; 2]> for HarmonicOscillator {
    fn rhs(&self, _t: f64, y: &[f64; 2], dydt: &mut [f64; 2]) -> Result<(), RhsError> {
        dydt[0] = y[1];
        dydt[1] = -self.omega * self.omega * y[0];
        Ok(())
    }
}

/// λ' = -(∂f/∂y)ᵀ λ, with -λᵀ ∂f/∂ω as quadrature integrand
impl AdjointSystem<[f64; 2]> for HarmonicOscillator {
    fn rhs(&self, _t: f64, _y: &[f64; 2], yb: &[f64; 2], ybdot: &mut [f64; 2]) -> Result<(), RhsError> {
        ybdot[0] = self.omega * self.omega * yb[1];
        ybdot[1] = -yb[0];
        Ok(())
    }

    fn quad_rhs(&self, _t: f64, y: &[f64; 2], yb: &[f64; 2], qbdot: &mut [f64; 2]) -> Result<(), RhsError> {
        qbdot[0] = 2.0 * self.omega * y[0] * yb[1];
        qbdot[1] = 0.0;
        Ok(())
    }
}

fn main() {
    let omega = 2.0;
    let sys = HarmonicOscillator { omega };
    let t_end = 2.5;

    for kind in [InterpolationKind::Hermite, InterpolationKind::Polynomial] {
        let mut forward = Rkf78::new(Tolerances::new(1e-12, 1e-12));
        forward.set_step_limits(1e-12, 0.02);
        forward.init(0.0, &[1.0, 0.0]).unwrap();
        let config = AdjointConfig {
            steps_per_checkpoint: 25,
            interpolation: kind,
        };
        let mut session = AdjointSession::new(forward, &config).unwrap();

        let mut y = [0.0; 2];
        session
            .integrate_forward(&sys, t_end, Task::Normal, &mut y)
            .unwrap();

        session
            .set_backward(Rkf78::new(Tolerances::new(1e-12, 1e-12)), t_end, &[1.0, 0.0])
            .unwrap();
        session.init_backward_quadrature(&[0.0, 0.0], None).unwrap();
        let mut yb = [0.0; 2];
        session
            .integrate_backward(&sys, &sys, 0.0, Task::Normal, &mut yb)
            .unwrap();
        let mut qb = [0.0; 2];
        session.get_quad_b(&mut qb).unwrap();

        let exact = -t_end * (omega * t_end).sin();
        println!("Harmonic Oscillator (ω = {omega}, {kind} interpolation)");
        println!("  y(T)      = {:.15}   (exact: {:.15})", y[0], (omega * t_end).cos());
        println!("  dy(T)/dω  = {:.12}   (exact: {:.12})", qb[0], exact);
        println!("  Error:      {:.2e}", (qb[0] - exact).abs());
        println!("  Checkpoints: {}", session.checkpoints().len());
        println!("  Restores:    {}", session.stats().restores);
        println!();
    }
}
