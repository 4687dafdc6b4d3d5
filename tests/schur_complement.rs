//! Verifies the Schur-complement operator and the four-step solve against a
//! dense reference assembly.

use nalgebra::{DMatrix, DVector};

mod common;

/// Builds the dense time-discretized Jacobian column by column from the
/// model's matrix-vector products.
fn dense_discretized_jacobian(
    model: &chromsol::GeneralRateModel,
    tau: f64,
    alpha: f64,
) -> DMatrix<f64> {
    let n = model.num_dofs();
    let mut jac = DMatrix::zeros(n, n);
    let mut unit = vec![0.0; n];
    let mut col = vec![0.0; n];
    let mut mass = vec![0.0; n];
    for j in 0..n {
        unit[j] = 1.0;
        col.fill(0.0);
        model.subtract_jacobian_product(&unit, &mut col);
        model.mass_times(tau, &unit, &mut mass);
        for i in 0..n {
            jac[(i, j)] = -col[i] + alpha * mass[i];
        }
        unit[j] = 0.0;
    }
    jac
}

fn pseudo_random_state(n: usize) -> Vec<f64> {
    (0..n).map(|i| 0.3 + 0.02 * ((i * 37) % 29) as f64).collect()
}

#[test]
fn test_schur_operator_matches_dense_reference() {
    let mut model = common::langmuir_dynamic();
    let n = model.num_dofs();
    let y = pseudo_random_state(n);
    model.assemble_jacobians(0, &y);

    let tau = 1.0;
    let alpha = 25.0;
    let dense = dense_discretized_jacobian(&model, tau, alpha);

    let idxr = model.indexer();
    let disc = model.discretization();
    let n_comp = disc.n_comp;
    let n_col = disc.n_col;
    let n_flux = n_col * n_comp;
    let offset_jf = idxr.offset_jf();
    let stride_block = idxr.stride_par_block();

    // Dense Schur complement S = I - sum_p J_{f,p} J_p^{-1} J_{p,f},
    // accumulated over all bulk and particle diagonal blocks
    let mut s_dense = DMatrix::<f64>::identity(n_flux, n_flux);
    let mut block_ranges: Vec<(usize, usize)> = (0..n_comp)
        .map(|comp| (comp * n_col, n_col))
        .collect();
    for cell in 0..n_col {
        block_ranges.push((n_comp * n_col + cell * stride_block, stride_block));
    }
    for (start, len) in block_ranges {
        let j_p = dense.view((start, start), (len, len)).into_owned();
        let j_pf = dense.view((start, offset_jf), (len, n_flux)).into_owned();
        let j_fp = dense.view((offset_jf, start), (n_flux, len)).into_owned();
        let solved = j_p.lu().solve(&j_pf).expect("diagonal block is regular");
        s_dense -= j_fp * solved;
    }

    // Matrix-free operator applied to the vector of all ones
    model.factorize_discretized(tau, alpha).unwrap();
    let ones = vec![1.0; n_flux];
    let mut z = vec![0.0; n_flux];
    model.schur_complement_times(&ones, &mut z).unwrap();

    let z_ref = &s_dense * DVector::from_element(n_flux, 1.0);
    for i in 0..n_flux {
        assert!(
            (z[i] - z_ref[i]).abs() < 1e-12,
            "flux row {i}: {} vs {}",
            z[i],
            z_ref[i]
        );
    }
}

#[test]
fn test_linear_solve_matches_dense_solve() {
    let mut model = common::linear_two_component();
    let n = model.num_dofs();
    let y = pseudo_random_state(n);
    model.assemble_jacobians(0, &y);

    let tau = 1.0;
    let alpha = 100.0;
    let dense = dense_discretized_jacobian(&model, tau, alpha);

    let b: Vec<f64> = (0..n).map(|i| ((i * 11) % 13) as f64 / 13.0 - 0.5).collect();
    let mut x = b.clone();
    let weight = vec![1.0; n];
    model
        .linear_solve(0.0, tau, alpha, 1e-12, &mut x, &weight)
        .unwrap();

    let x_ref = dense
        .lu()
        .solve(&DVector::from_column_slice(&b))
        .expect("dense solve");
    for i in 0..n {
        assert!(
            (x[i] - x_ref[i]).abs() < 1e-9 * (1.0 + x_ref[i].abs()),
            "row {i}: {} vs {}",
            x[i],
            x_ref[i]
        );
    }
}

#[test]
fn test_solve_is_idempotent_across_calls() {
    let mut model = common::linear_two_component();
    let n = model.num_dofs();
    let y = pseudo_random_state(n);
    model.assemble_jacobians(0, &y);

    let b: Vec<f64> = (0..n).map(|i| (i % 7) as f64 - 3.0).collect();
    let weight = vec![1.0; n];

    let mut x1 = b.clone();
    model.linear_solve(0.0, 1.0, 50.0, 1e-10, &mut x1, &weight).unwrap();
    let count_after_first = model.timers().factorize.count();

    let mut x2 = b.clone();
    model.linear_solve(0.0, 1.0, 50.0, 1e-10, &mut x2, &weight).unwrap();

    assert_eq!(x1, x2);
    assert_eq!(model.timers().factorize.count(), count_after_first);
}
