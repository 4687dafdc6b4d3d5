//! End-to-end integration of a two-component pulse through a linear-isotherm
//! column: conservation, retention, and basic regression properties.

use chromsol::{InMemoryProvider, InMemoryRecorder, ParamId, Simulator};

mod common;

#[test]
fn test_two_component_pulse_elutes_conservatively() {
    let model = common::linear_two_component();
    let idxr_outlet = {
        let idxr = model.indexer();
        [idxr.offset_c(0, 15), idxr.offset_c(1, 15)]
    };

    let mut sim = Simulator::new();
    sim.initialize_model(model);
    // 100 s feed pulse, then 1900 s of clean eluent
    sim.set_section_times(&[0.0, 100.0, 2000.0]);
    let solution_times: Vec<f64> = (0..=400).map(|i| i as f64 * 5.0).collect();
    sim.set_solution_times(&solution_times);
    sim.configure_time_integrator(1e-6, 1e-9, 1e-4, 200_000);

    let mut provider = InMemoryProvider::new();
    provider
        .set_array("INIT_C", &[0.0, 0.0])
        .set_array("INIT_Q", &[0.0, 0.0]);
    sim.set_initial_condition_from(&provider).unwrap();

    let mut recorder = InMemoryRecorder::default();
    sim.integrate(&mut recorder).unwrap();

    assert!(recorder.times.len() > 100, "expected a dense chromatogram");

    let outlet: Vec<[f64; 2]> = recorder
        .solutions
        .iter()
        .map(|y| [y[idxr_outlet[0]], y[idxr_outlet[1]]])
        .collect();

    // Concentrations stay physical
    for (k, c) in outlet.iter().enumerate() {
        assert!(c[0] > -1e-8 && c[1] > -1e-8, "negative outlet at index {k}");
        assert!(c[0] < 1.1 && c[1] < 0.55, "overshoot at index {k}");
    }

    // The pulse must have produced a clear peak after the dead time
    let (peak_index, peak) = outlet
        .iter()
        .enumerate()
        .max_by(|a, b| a.1[0].total_cmp(&b.1[0]))
        .unwrap();
    assert!(peak[0] > 0.05, "peak too small: {}", peak[0]);
    assert!(
        recorder.times[peak_index] > 100.0,
        "retained peak cannot appear before the column dead time"
    );

    // Mass balance: trapezoidal integral of the outlet against the injected
    // amount (100 s of c_in), with room for hold-up and numerical dispersion
    let mut eluted = [0.0_f64; 2];
    for k in 1..outlet.len() {
        let dt = recorder.times[k] - recorder.times[k - 1];
        for comp in 0..2 {
            eluted[comp] += 0.5 * dt * (outlet[k][comp] + outlet[k - 1][comp]);
        }
    }
    let injected = [100.0 * 1.0, 100.0 * 0.5];
    for comp in 0..2 {
        assert!(
            eluted[comp] < 1.02 * injected[comp],
            "component {comp} eluted more than was injected: {} vs {}",
            eluted[comp],
            injected[comp]
        );
        assert!(
            eluted[comp] > 0.4 * injected[comp],
            "component {comp} mostly failed to elute: {} vs {}",
            eluted[comp],
            injected[comp]
        );
    }

    // Identical binding for both components: the chromatograms scale with
    // the feed composition
    for k in 0..outlet.len() {
        assert!(
            (outlet[k][1] - 0.5 * outlet[k][0]).abs() < 5e-3,
            "components with identical parameters must co-elute (index {k})"
        );
    }
}

#[test]
fn test_sensitivity_integration_smoke() {
    let model = common::linear_two_component();
    let outlet0 = model.indexer().offset_c(0, 15);

    let mut sim = Simulator::new();
    sim.initialize_model(model);
    sim.set_section_times(&[0.0, 50.0]);
    sim.set_solution_times(&[10.0, 25.0, 50.0]);
    sim.configure_time_integrator(1e-6, 1e-9, 1e-4, 50_000);
    sim.set_sensitive_parameter(ParamId::BindingKa(0), 1e-8).unwrap();

    let mut provider = InMemoryProvider::new();
    provider
        .set_array("INIT_C", &[0.0, 0.0])
        .set_array("INIT_Q", &[0.0, 0.0]);
    sim.set_initial_condition_from(&provider).unwrap();

    let mut recorder = InMemoryRecorder::default();
    sim.integrate(&mut recorder).unwrap();

    let sens = sim.last_sensitivities();
    assert_eq!(sens.len(), 1);
    assert!(sens[0].iter().all(|v| v.is_finite()));
    // Binding strength affects the hold-up, so the sensitivity of the
    // in-column state cannot be identically zero
    let max_sens = sens[0].iter().fold(0.0_f64, |a, v| a.max(v.abs()));
    assert!(max_sens > 0.0, "sensitivities remained identically zero");

    let last = recorder.solutions.last().unwrap();
    assert!(last[outlet0].is_finite());
}
