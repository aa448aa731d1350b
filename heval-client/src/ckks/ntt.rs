//! Number Theoretic Transform over NTT-friendly primes.
//!
//! Each prime q of the modulus chain satisfies q ≡ 1 (mod 2N), so Z_q holds
//! a primitive 2N-th root of unity ψ. Twisting coefficients by ψ^i turns the
//! cyclic NTT into evaluation on the roots of X^N + 1, which makes
//! element-wise products in the evaluation domain negacyclic convolutions.

/// Precomputed tables for one prime and one ring degree.
#[derive(Clone, Debug)]
pub struct NttTable {
    q: u64,
    degree: usize,
    /// ψ^i for i in 0..N
    psi_powers: Vec<u64>,
    /// ψ^-i for i in 0..N
    psi_inv_powers: Vec<u64>,
    /// Primitive len-th roots for each butterfly stage, len = 2, 4, …, N.
    stage_roots: Vec<u64>,
    stage_roots_inv: Vec<u64>,
    n_inv: u64,
}

impl NttTable {
    /// Tables for `q` in Z_q[X]/(X^N + 1). `None` when q is not ≡ 1 mod 2N
    /// or no primitive 2N-th root is found.
    pub fn new(q: u64, degree: usize) -> Option<Self> {
        if !degree.is_power_of_two() || degree < 2 {
            return None;
        }
        let psi = find_primitive_root(q, degree)?;
        let psi_inv = mod_inv(psi, q);
        let n_inv = mod_inv(degree as u64 % q, q);

        let mut stage_roots = Vec::new();
        let mut stage_roots_inv = Vec::new();
        let mut len = 2;
        while len <= degree {
            let exp = (2 * degree / len) as u64;
            stage_roots.push(mod_pow(psi, exp, q));
            stage_roots_inv.push(mod_pow(psi_inv, exp, q));
            len <<= 1;
        }

        Some(Self {
            q,
            degree,
            psi_powers: powers(psi, degree, q),
            psi_inv_powers: powers(psi_inv, degree, q),
            stage_roots,
            stage_roots_inv,
            n_inv,
        })
    }

    pub fn modulus(&self) -> u64 {
        self.q
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Coefficient → evaluation domain. Inputs must lie in [0, q).
    pub fn forward(&self, a: &[u64]) -> Vec<u64> {
        let q = self.q;
        let mut data: Vec<u64> = a
            .iter()
            .zip(&self.psi_powers)
            .map(|(&c, &pw)| mul_mod(c, pw, q))
            .collect();
        bit_reverse_permutation(&mut data);
        butterflies(&mut data, &self.stage_roots, q);
        data
    }

    /// Evaluation → coefficient domain.
    pub fn inverse(&self, a: &[u64]) -> Vec<u64> {
        let q = self.q;
        let mut data = a.to_vec();
        bit_reverse_permutation(&mut data);
        butterflies(&mut data, &self.stage_roots_inv, q);
        for (v, &pw) in data.iter_mut().zip(&self.psi_inv_powers) {
            *v = mul_mod(mul_mod(*v, self.n_inv, q), pw, q);
        }
        data
    }

    /// Negacyclic product of two residue vectors.
    pub fn mul(&self, a: &[u64], b: &[u64]) -> Vec<u64> {
        let a_ntt = self.forward(a);
        let b_ntt = self.forward(b);
        let product: Vec<u64> = a_ntt
            .iter()
            .zip(&b_ntt)
            .map(|(&x, &y)| mul_mod(x, y, self.q))
            .collect();
        self.inverse(&product)
    }

    /// acc += a ⊙ b in the evaluation domain.
    pub fn mul_acc(&self, acc: &mut [u64], a: &[u64], b: &[u64]) {
        for ((dst, &x), &y) in acc.iter_mut().zip(a).zip(b) {
            *dst = add_mod(*dst, mul_mod(x, y, self.q), self.q);
        }
    }
}

fn butterflies(data: &mut [u64], roots: &[u64], q: u64) {
    let n = data.len();
    let mut len = 2;
    for &w in roots {
        let half = len / 2;
        let mut start = 0;
        while start < n {
            let mut wk = 1u64;
            for k in 0..half {
                let u = data[start + k];
                let v = mul_mod(data[start + k + half], wk, q);
                data[start + k] = add_mod(u, v, q);
                data[start + k + half] = sub_mod(u, v, q);
                wk = mul_mod(wk, w, q);
            }
            start += len;
        }
        len <<= 1;
    }
}

fn powers(root: u64, n: usize, q: u64) -> Vec<u64> {
    let mut out = Vec::with_capacity(n);
    let mut acc = 1u64;
    for _ in 0..n {
        out.push(acc);
        acc = mul_mod(acc, root, q);
    }
    out
}

fn bit_reverse_permutation(data: &mut [u64]) {
    let n = data.len();
    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = bit_reverse(i, bits);
        if i < j {
            data.swap(i, j);
        }
    }
}

fn bit_reverse(mut v: usize, bits: u32) -> usize {
    let mut r = 0;
    for _ in 0..bits {
        r = (r << 1) | (v & 1);
        v >>= 1;
    }
    r
}

#[inline]
pub fn mul_mod(a: u64, b: u64, q: u64) -> u64 {
    ((a as u128 * b as u128) % q as u128) as u64
}

#[inline]
pub fn add_mod(a: u64, b: u64, q: u64) -> u64 {
    let s = a + b;
    if s >= q {
        s - q
    } else {
        s
    }
}

#[inline]
pub fn sub_mod(a: u64, b: u64, q: u64) -> u64 {
    if a >= b {
        a - b
    } else {
        a + q - b
    }
}

/// Reduce a signed value into [0, q).
#[inline]
pub fn reduce_signed(x: i128, q: u64) -> u64 {
    x.rem_euclid(q as i128) as u64
}

pub fn mod_pow(base: u64, mut exp: u64, q: u64) -> u64 {
    let mut acc = 1u64 % q;
    let mut b = base % q;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, b, q);
        }
        b = mul_mod(b, b, q);
        exp >>= 1;
    }
    acc
}

/// Inverse modulo a prime, by Fermat.
pub fn mod_inv(a: u64, q: u64) -> u64 {
    mod_pow(a, q - 2, q)
}

/// A primitive 2N-th root of unity mod q: ψ = g^((q-1)/2N) with ψ^N = -1.
pub fn find_primitive_root(q: u64, degree: usize) -> Option<u64> {
    let two_n = 2 * degree as u64;
    if q < 3 || (q - 1) % two_n != 0 {
        return None;
    }
    let exp = (q - 1) / two_n;
    (2..1000u64)
        .map(|g| mod_pow(g, exp, q))
        .find(|&psi| mod_pow(psi, degree as u64, q) == q - 1)
}
