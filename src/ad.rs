//! Forward-mode automatic differentiation with a fixed number of directions.
//!
//! Parameter sensitivities are obtained by evaluating the residual once with
//! all sensitive parameters seeded in distinct directions. The dual number
//! [`Active`] carries the value together with one derivative slot per
//! direction; [`MAX_DIRECTIONS`] bounds the number of simultaneously tracked
//! parameters.

use num_traits::{One, Zero};
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

/// Maximum number of simultaneously tracked sensitivity directions.
pub const MAX_DIRECTIONS: usize = 8;

/// Dual number with a fixed derivative vector.
#[derive(Clone, Copy, Debug)]
pub struct Active {
    v: f64,
    d: [f64; MAX_DIRECTIONS],
}

impl Active {
    /// A constant: value with all derivatives zero.
    pub fn constant(v: f64) -> Self {
        Self {
            v,
            d: [0.0; MAX_DIRECTIONS],
        }
    }

    /// A parameter seeded in direction `dir` with seed derivative `seed`.
    pub fn with_direction(v: f64, dir: usize, seed: f64) -> Self {
        let mut d = [0.0; MAX_DIRECTIONS];
        d[dir] = seed;
        Self { v, d }
    }

    pub fn value(&self) -> f64 {
        self.v
    }

    pub fn derivative(&self, dir: usize) -> f64 {
        self.d[dir]
    }

    pub fn set_value(&mut self, v: f64) {
        self.v = v;
    }

    /// Seeds direction `dir`, clearing any previously set direction.
    pub fn set_direction(&mut self, dir: usize, seed: f64) {
        self.d = [0.0; MAX_DIRECTIONS];
        self.d[dir] = seed;
    }

    pub fn powi(self, n: i32) -> Self {
        let mut d = [0.0; MAX_DIRECTIONS];
        let dv = f64::from(n) * self.v.powi(n - 1);
        for (dst, src) in d.iter_mut().zip(self.d.iter()) {
            *dst = dv * src;
        }
        Self {
            v: self.v.powi(n),
            d,
        }
    }

}

impl From<f64> for Active {
    fn from(v: f64) -> Self {
        Active::constant(v)
    }
}

impl Add for Active {
    type Output = Active;
    fn add(self, rhs: Active) -> Active {
        let mut d = self.d;
        for (a, b) in d.iter_mut().zip(rhs.d.iter()) {
            *a += b;
        }
        Active { v: self.v + rhs.v, d }
    }
}

impl Sub for Active {
    type Output = Active;
    fn sub(self, rhs: Active) -> Active {
        let mut d = self.d;
        for (a, b) in d.iter_mut().zip(rhs.d.iter()) {
            *a -= b;
        }
        Active { v: self.v - rhs.v, d }
    }
}

impl Mul for Active {
    type Output = Active;
    fn mul(self, rhs: Active) -> Active {
        let mut d = [0.0; MAX_DIRECTIONS];
        for i in 0..MAX_DIRECTIONS {
            d[i] = self.d[i] * rhs.v + self.v * rhs.d[i];
        }
        Active { v: self.v * rhs.v, d }
    }
}

impl Div for Active {
    type Output = Active;
    fn div(self, rhs: Active) -> Active {
        let inv = 1.0 / rhs.v;
        let val = self.v * inv;
        let mut d = [0.0; MAX_DIRECTIONS];
        for i in 0..MAX_DIRECTIONS {
            d[i] = (self.d[i] - val * rhs.d[i]) * inv;
        }
        Active { v: val, d }
    }
}

impl Neg for Active {
    type Output = Active;
    fn neg(self) -> Active {
        let mut d = self.d;
        for a in d.iter_mut() {
            *a = -*a;
        }
        Active { v: -self.v, d }
    }
}

impl AddAssign for Active {
    fn add_assign(&mut self, rhs: Active) {
        *self = *self + rhs;
    }
}

impl SubAssign for Active {
    fn sub_assign(&mut self, rhs: Active) {
        *self = *self - rhs;
    }
}

impl MulAssign for Active {
    fn mul_assign(&mut self, rhs: Active) {
        *self = *self * rhs;
    }
}

impl Add<f64> for Active {
    type Output = Active;
    fn add(self, rhs: f64) -> Active {
        Active {
            v: self.v + rhs,
            d: self.d,
        }
    }
}

impl Sub<f64> for Active {
    type Output = Active;
    fn sub(self, rhs: f64) -> Active {
        Active {
            v: self.v - rhs,
            d: self.d,
        }
    }
}

impl Mul<f64> for Active {
    type Output = Active;
    fn mul(self, rhs: f64) -> Active {
        let mut d = self.d;
        for a in d.iter_mut() {
            *a *= rhs;
        }
        Active { v: self.v * rhs, d }
    }
}

impl Div<f64> for Active {
    type Output = Active;
    fn div(self, rhs: f64) -> Active {
        self * (1.0 / rhs)
    }
}

impl Add<Active> for f64 {
    type Output = Active;
    fn add(self, rhs: Active) -> Active {
        rhs + self
    }
}

impl Sub<Active> for f64 {
    type Output = Active;
    fn sub(self, rhs: Active) -> Active {
        -rhs + self
    }
}

impl Mul<Active> for f64 {
    type Output = Active;
    fn mul(self, rhs: Active) -> Active {
        rhs * self
    }
}

impl Div<Active> for f64 {
    type Output = Active;
    fn div(self, rhs: Active) -> Active {
        Active::constant(self) / rhs
    }
}

impl Zero for Active {
    fn zero() -> Self {
        Active::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.v == 0.0 && self.d.iter().all(|x| *x == 0.0)
    }
}

impl One for Active {
    fn one() -> Self {
        Active::constant(1.0)
    }
}

/// Scalar abstraction the residual evaluation is generic over.
///
/// Instantiated with `f64` for plain residuals (the hot path of the Newton
/// iteration) and with [`Active`] when parameter derivatives are required
/// during consistent initialization of the sensitivity systems.
pub trait Real:
    Copy
    + std::fmt::Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
{
    fn from_f64(v: f64) -> Self;
    /// Lifts a stored parameter: `f64` takes the value, [`Active`] keeps the
    /// derivative information.
    fn from_active(a: Active) -> Self;
    fn value(&self) -> f64;
    fn powi(self, n: i32) -> Self;
    /// `self^e` for a constant real exponent; the base must be positive.
    fn powf_const(self, e: f64) -> Self;
}

impl Real for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
    fn from_active(a: Active) -> Self {
        a.value()
    }
    fn value(&self) -> f64 {
        *self
    }
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
    fn powf_const(self, e: f64) -> Self {
        f64::powf(self, e)
    }
}

impl Real for Active {
    fn from_f64(v: f64) -> Self {
        Active::constant(v)
    }
    fn from_active(a: Active) -> Self {
        a
    }
    fn value(&self) -> f64 {
        Active::value(self)
    }
    fn powi(self, n: i32) -> Self {
        Active::powi(self, n)
    }
    fn powf_const(self, e: f64) -> Self {
        let val = self.v.powf(e);
        let dv = e * self.v.powf(e - 1.0);
        let mut d = [0.0; MAX_DIRECTIONS];
        for (dst, src) in d.iter_mut().zip(self.d.iter()) {
            *dst = dv * src;
        }
        Active { v: val, d }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_rule() {
        let a = Active::with_direction(3.0, 0, 1.0);
        let b = Active::with_direction(5.0, 1, 1.0);
        let c = a * b;
        assert_eq!(c.value(), 15.0);
        assert_eq!(c.derivative(0), 5.0);
        assert_eq!(c.derivative(1), 3.0);
    }

    #[test]
    fn test_quotient_rule() {
        let a = Active::with_direction(6.0, 0, 1.0);
        let b = Active::constant(2.0);
        let c = a / b;
        assert_eq!(c.value(), 3.0);
        assert_eq!(c.derivative(0), 0.5);

        // d/dx (6 / x) at x = 2 is -6/4
        let x = Active::with_direction(2.0, 0, 1.0);
        let y = Active::constant(6.0) / x;
        assert_eq!(y.derivative(0), -1.5);
    }

    #[test]
    fn test_powi() {
        let x = Active::with_direction(2.0, 0, 1.0);
        let y = x.powi(3);
        assert_eq!(y.value(), 8.0);
        assert_eq!(y.derivative(0), 12.0);
    }

    #[test]
    fn test_mixed_f64_ops() {
        let x = Active::with_direction(4.0, 0, 1.0);
        let y = 2.0 * x + 1.0;
        assert_eq!(y.value(), 9.0);
        assert_eq!(y.derivative(0), 2.0);

        let z = 1.0 - x;
        assert_eq!(z.value(), -3.0);
        assert_eq!(z.derivative(0), -1.0);
    }

    #[test]
    fn test_real_lift() {
        let p = Active::with_direction(7.0, 2, 1.0);
        let as_f64 = <f64 as Real>::from_active(p);
        assert_eq!(as_f64, 7.0);
        let as_active = <Active as Real>::from_active(p);
        assert_eq!(as_active.derivative(2), 1.0);
    }
}
