//! Consistent initialization of the full model: flux consistency, algebraic
//! equilibria, charge balance, and the lean shortcut.

use chromsol::InMemoryProvider;

mod common;

fn provider(init_c: &[f64], init_q: &[f64]) -> InMemoryProvider {
    let mut p = InMemoryProvider::new();
    p.set_array("INIT_C", init_c).set_array("INIT_Q", init_q);
    p
}

#[test]
fn test_full_initialization_zeroes_the_residual() {
    let mut model = common::linear_two_component();
    let n = model.num_dofs();
    let p = provider(&[0.0, 0.0], &[0.0, 0.0]);
    let mut y = vec![0.0; n];
    let mut y_dot = vec![0.0; n];
    model.apply_initial_condition(&p, &mut y, &mut y_dot).unwrap();
    model
        .consistent_initial_conditions(0.0, 0, 1.0, &mut y, &mut y_dot, 1e-12)
        .unwrap();

    let mut res = vec![0.0; n];
    model.residual(0.0, 0, 1.0, &y, Some(&y_dot), &mut res);
    let max = res.iter().fold(0.0_f64, |a, r| a.max(r.abs()));
    assert!(max < 1e-10, "residual after initialization: {max}");
}

#[test]
fn test_sma_initialization_solves_algebraic_block() {
    let mut model = common::sma_quasi_stationary();
    let disc = model.discretization().clone();
    let idxr_offsets = {
        let idxr = model.indexer();
        (
            idxr.offset_cp(0),
            idxr.stride_par_shell(),
            idxr.stride_par_block(),
            idxr.offset_jf(),
        )
    };
    let (offset_cp, stride_shell, stride_block, offset_jf) = idxr_offsets;
    let n = model.num_dofs();

    // Column equilibrated with 50 mM salt, lightly loaded proteins
    let p = provider(&[50.0, 0.05, 0.04], &[1200.0, 0.0, 0.0]);
    let mut y = vec![0.0; n];
    let mut y_dot = vec![0.0; n];
    model.apply_initial_condition(&p, &mut y, &mut y_dot).unwrap();
    model
        .consistent_initial_conditions(0.0, 0, 1.0, &mut y, &mut y_dot, 1e-12)
        .unwrap();

    let binding = match model.binding() {
        chromsol::BindingModel::StericMassAction(b) => b.clone(),
        _ => unreachable!(),
    };

    for cell in 0..disc.n_col {
        for shell in 0..disc.n_par {
            let off = offset_cp + cell * stride_block + shell * stride_shell;
            let cp = &y[off..off + disc.n_comp];
            let q = &y[off + disc.n_comp..off + stride_shell];

            // Algebraic residual below tolerance at every shell
            let mut res = [0.0_f64; 3];
            binding.residual(1.0, cp, q, None, &mut res);
            for (b, r) in res.iter().enumerate() {
                assert!(
                    r.abs() < 1e-9,
                    "cell {cell} shell {shell} bound state {b}: residual {r}"
                );
            }

            // Charge balance holds bit for bit
            assert_eq!(q[0], binding.charge_balance_salt(q));
        }
    }

    // Flux consistency: j_f = k_f (c - c_p(r_p))
    let kf = 6.9e-6;
    let surface = (disc.n_par - 1) * stride_shell;
    for cell in 0..disc.n_col {
        for comp in 0..disc.n_comp {
            let jf = y[offset_jf + cell * disc.n_comp + comp];
            let c = y[comp * disc.n_col + cell];
            let cp = y[offset_cp + cell * stride_block + surface + comp];
            assert!(
                (jf - kf * (c - cp)).abs() < 1e-14 * (1.0 + jf.abs()),
                "flux inconsistency at cell {cell}, comp {comp}"
            );
        }
    }
}

#[test]
fn test_lean_matches_full_for_dynamic_isotherm_at_rest() {
    // Without algebraic equations and starting from an empty, equilibrated
    // column, the lean shortcut must reproduce the full pipeline bit for bit
    let mut full = common::langmuir_dynamic();
    let mut lean = common::langmuir_dynamic();
    let n = full.num_dofs();

    let mut y_full = vec![0.0; n];
    let mut y_dot_full = vec![0.0; n];
    full.consistent_initial_conditions(0.0, 0, 1.0, &mut y_full, &mut y_dot_full, 1e-12)
        .unwrap();

    let mut y_lean = vec![0.0; n];
    let mut y_dot_lean = vec![0.0; n];
    lean.lean_consistent_initial_conditions(0.0, 0, 1.0, &mut y_lean, &mut y_dot_lean)
        .unwrap();

    assert_eq!(y_full, y_lean);
    assert_eq!(y_dot_full, y_dot_lean);
}

#[test]
fn test_initialization_marks_jacobian_dirty() {
    let mut model = common::sma_quasi_stationary();
    let n = model.num_dofs();
    let p = provider(&[50.0, 0.0, 0.0], &[1200.0, 0.0, 0.0]);
    let mut y = vec![0.0; n];
    let mut y_dot = vec![0.0; n];
    model.apply_initial_condition(&p, &mut y, &mut y_dot).unwrap();

    model.assemble_jacobians(0, &y);
    // A successful solve clears the flag...
    let mut rhs = vec![1.0; n];
    let weight = vec![1.0; n];
    model.linear_solve(0.0, 1.0, 10.0, 1e-8, &mut rhs, &weight).unwrap();
    assert!(!model.needs_factorization());

    // ...and the state step dirties it again because the factorizable
    // storage was reused as dense scratch
    model
        .consistent_initial_state(0.0, 0, 1.0, &mut y, 1e-10)
        .unwrap();
    assert!(model.needs_factorization());
}
