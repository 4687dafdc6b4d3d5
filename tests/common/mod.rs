//! Shared model builders for the integration tests.
#![allow(dead_code)]

use chromsol::model::binding::{BindingModel, LangmuirBinding, LinearBinding, SmaBinding};
use chromsol::{ColumnParams, Discretization, GeneralRateModel, Inlet, InletSection};

/// Two-component column with a dynamic linear isotherm, matching the
/// two-component pulse regression scenario: 16 axial cells, 4 radial shells,
/// `k_eq = 2`.
pub fn linear_two_component() -> GeneralRateModel {
    let disc = Discretization::new(2, 16, 4, vec![1, 1]);
    let params = ColumnParams::new(
        0.1,    // column length
        0.4,    // column porosity
        0.3,    // particle porosity
        5e-5,   // particle radius
        1e-3,   // interstitial velocity
        1e-5,   // axial dispersion
        &[1e-3, 1e-3],
        &[1e-10, 1e-10],
        &[0.0, 0.0],
    );
    let binding = BindingModel::Linear(LinearBinding::new(
        vec![1, 1],
        &[2.0, 2.0],
        &[1.0, 1.0],
        false,
    ));
    // 100 s rectangular pulse of [1.0, 0.5], then clean feed
    let inlet = Inlet {
        sections: vec![
            InletSection::constant_profile(&[1.0, 0.5]),
            InletSection::constant_profile(&[0.0, 0.0]),
        ],
    };
    GeneralRateModel::new(disc, params, binding, inlet).unwrap()
}

/// Three-component steric mass action column (salt plus two proteins) with a
/// quasi-stationary isotherm and a salt gradient from 50 to 500 over 2000 s.
pub fn sma_quasi_stationary() -> GeneralRateModel {
    let disc = Discretization::new(3, 8, 3, vec![1, 1, 1]);
    let params = ColumnParams::new(
        0.014,
        0.37,
        0.75,
        4.5e-5,
        5.75e-4,
        5.75e-8,
        &[6.9e-6, 6.9e-6, 6.9e-6],
        &[7e-10, 6.07e-11, 6.07e-11],
        &[0.0, 0.0, 0.0],
    );
    let binding = BindingModel::StericMassAction(SmaBinding::new(
        1200.0,
        &[1.0, 5.0, 4.0],
        &[0.0, 11.0, 10.0],
        &[0.0, 2e-13, 2.5e-10],
        &[0.0, 3.2e-9, 2e-7],
        true,
    ));
    let inlet = Inlet {
        sections: vec![InletSection::linear_profile(
            &[50.0, 0.1, 0.1],
            &[0.225, 0.0, 0.0],
        )],
    };
    GeneralRateModel::new(disc, params, binding, inlet).unwrap()
}

/// Dynamic multi-component Langmuir column without algebraic equations.
pub fn langmuir_dynamic() -> GeneralRateModel {
    let disc = Discretization::new(2, 8, 3, vec![1, 1]);
    let params = ColumnParams::new(
        0.1,
        0.4,
        0.33,
        4.5e-5,
        2e-3,
        2e-5,
        &[1.2e-3, 9e-4],
        &[1e-10, 1.5e-10],
        &[0.0, 0.0],
    );
    let binding = BindingModel::Langmuir(LangmuirBinding::new(
        &[1.14, 2.0],
        &[2e-3, 1e-3],
        &[4.88, 3.5],
    ));
    let inlet = Inlet {
        sections: vec![InletSection::constant_profile(&[1.0, 1.0])],
    };
    GeneralRateModel::new(disc, params, binding, inlet).unwrap()
}
