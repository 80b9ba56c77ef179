use proptest::prelude::*;
use tempsim::{generator::HUMIDITY_RANGE, RandomWalkGenerator, SimulationBounds, SimulationState};

const EPS: f64 = 1e-9;

fn bounds(temp_min: f64, temp_span: f64, pressure_min: f64, pressure_span: f64) -> SimulationBounds {
    SimulationBounds {
        machine_temp_min: temp_min,
        machine_temp_max: temp_min + temp_span,
        machine_pressure_min: pressure_min,
        machine_pressure_max: pressure_min + pressure_span,
        ..SimulationBounds::default()
    }
}

proptest! {
    #[test]
    fn pressure_is_linear_in_temperature(
        seed in any::<u64>(),
        steps in 1usize..150,
        temp_min in -40.0f64..60.0,
        temp_span in prop_oneof![Just(0.0f64), 0.5f64..80.0],
        pressure_min in 0.0f64..50.0,
        pressure_span in 0.0f64..200.0,
    ) {
        let bounds = bounds(temp_min, temp_span, pressure_min, pressure_span);
        let slope = if temp_span == 0.0 { 0.0 } else { pressure_span / temp_span };
        let mut generator = RandomWalkGenerator::seeded(seed);
        let mut state = SimulationState::new(&bounds);

        for _ in 0..steps {
            let reading = generator.next(&bounds, &mut state);
            let expected = pressure_min + (reading.machine.temperature - temp_min) * slope;
            prop_assert!((reading.machine.pressure - expected).abs() <= 1e-6 * (1.0 + expected.abs()));
        }
    }

    #[test]
    fn steps_stay_in_their_bands(seed in any::<u64>(), steps in 1usize..300, temp_span in 0.0f64..10.0) {
        let bounds = bounds(20.0, temp_span, 10.0, 90.0);
        let mut generator = RandomWalkGenerator::seeded(seed);
        let mut state = SimulationState::new(&bounds);

        for _ in 0..steps {
            let before = state.temperature();
            let reading = generator.next(&bounds, &mut state);
            let delta = reading.machine.temperature - before;

            if before > bounds.machine_temp_max {
                prop_assert!((-0.5 - EPS..=0.5 + EPS).contains(&delta));
            } else {
                prop_assert!((-0.25 - EPS..=1.25 + EPS).contains(&delta));
            }
            prop_assert!(HUMIDITY_RANGE.contains(&reading.ambient.humidity));
            prop_assert!((bounds.ambient_temp - 0.5..=bounds.ambient_temp + 0.5).contains(&reading.ambient.temperature));
        }
        prop_assert_eq!(state.sequence(), 1);
    }
}
