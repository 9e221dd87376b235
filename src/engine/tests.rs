use std::collections::BTreeSet;
use std::time::Duration;

use super::*;
use crate::catalogue::PriorityClass;
use crate::error::CatalogueError;
use crate::graph::Producer;
use crate::market_data::FixedAvailability;
use crate::report::{BudgetLimit, CandidateOutcome, UnsatisfiedReason};
use crate::testing::{MockFunction, at, day, swap, usd};
use crate::value::{FUNCTION_PROPERTY, ValueSpecification};

fn engine(repository: InMemoryRepository) -> Engine {
    Engine::builder().repository(repository).finish()
}

fn request(requirements: impl IntoIterator<Item = ValueRequirement>) -> BuildRequest {
    requirements
        .into_iter()
        .fold(BuildRequest::new("Default", at(1)), BuildRequest::with)
}

fn pv(n: u32) -> ValueRequirement {
    ValueRequirement::new("PresentValue", swap(n))
}

/// The function producing the terminal output of `requirement`.
fn producer_of<'a>(graph: &'a DependencyGraph, requirement: &ValueRequirement) -> Option<&'a str> {
    let index = graph.terminal_node(requirement)?;
    graph.node(index)?.function_id()
}

/// Functions feeding the terminal node of `requirement`, in input order.
fn inputs_of(graph: &DependencyGraph, requirement: &ValueRequirement) -> Vec<String> {
    let index = graph.terminal_node(requirement).unwrap();
    graph
        .inputs_of(index)
        .into_iter()
        .map(|(source, _)| graph.node(source).unwrap().producer().to_string())
        .collect()
}

fn count_producer(graph: &DependencyGraph, id: &str) -> usize {
    graph
        .nodes()
        .filter(|(_, node)| node.function_id() == Some(id))
        .count()
}

#[test]
fn test_self_requirement_is_a_cycle() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("loop").produces("PresentValue").needs("PresentValue"))
            .with(MockFunction::new("delta").produces("Delta")),
    );
    let delta = ValueRequirement::new("Delta", swap(1));

    let graph = engine.build(&request([pv(1), delta.clone()])).unwrap();

    assert_eq!(graph.unsatisfied().get(&pv(1)), Some(&UnsatisfiedReason::Cycle));
    assert_eq!(producer_of(&graph, &delta), Some("delta"));
    assert!(graph.is_acyclic());

    let trace = graph.failure_trace(&pv(1)).unwrap();
    assert_eq!(trace.candidates.len(), 1);
    assert_eq!(trace.candidates[0].function, "loop");
    let CandidateOutcome::InputsFailed { input } = &trace.candidates[0].outcome else {
        panic!("expected the input to fail");
    };
    assert_eq!(input.reason, UnsatisfiedReason::Cycle);
}

#[test]
fn test_cycle_through_another_value() {
    // PresentValue -> Yield -> PresentValue, broken by the lower-ranked curve.
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv").produces("PresentValue").needs("Yield"))
            .with(MockFunction::new("implied").produces("Yield").needs("PresentValue"))
            .with(MockFunction::new("curve").priority(PriorityClass::Low).produces("Yield")),
    );
    let yield_ = ValueRequirement::new("Yield", swap(1));

    let graph = engine.build(&request([pv(1), yield_.clone()])).unwrap();

    assert!(graph.unsatisfied().is_empty());
    assert_eq!(inputs_of(&graph, &pv(1)), ["curve"]);
    assert_eq!(producer_of(&graph, &yield_), Some("curve"));
    assert_eq!(count_producer(&graph, "curve"), 1);
    assert!(graph.is_acyclic());
}

/// `V0 -> V1 -> ... -> V{length - 1}`, each value from its own function.
fn chain(length: usize) -> InMemoryRepository {
    (0..length).fold(InMemoryRepository::new(), |repository, i| {
        let function = MockFunction::new(&format!("f{i}")).produces(&format!("V{i}"));
        match i + 1 < length {
            true => repository.with(function.needs(&format!("V{}", i + 1))),
            false => repository.with(function),
        }
    })
}

#[test]
fn test_deep_chain_is_not_a_cycle() {
    let top = ValueRequirement::new("V0", swap(1));
    let options = BuildOptions {
        max_depth: 16,
        ..BuildOptions::default()
    };
    let shallow = Engine::builder().repository(chain(20)).options(options).finish();

    let graph = shallow.build(&request([top.clone()])).unwrap();
    assert_eq!(
        graph.unsatisfied().get(&top),
        Some(&UnsatisfiedReason::DepthExceeded { max_depth: 16 })
    );
    assert_eq!(graph.node_count(), 0);

    let graph = engine(chain(20)).build(&request([top.clone()])).unwrap();
    assert!(graph.unsatisfied().is_empty());
    assert_eq!(graph.node_count(), 20);
    assert_eq!(producer_of(&graph, &top), Some("f0"));
}

#[test]
fn test_observable_value_shared() {
    let engine = Engine::builder()
        .repository(
            InMemoryRepository::new()
                .with(MockFunction::new("pv").produces("PresentValue").needs_on("MarketValue", usd())),
        )
        .market_data(FixedAvailability::new().with("MarketValue", usd(), PropertySet::new()))
        .finish();

    let graph = engine.build(&request([pv(1), pv(2)])).unwrap();

    let observed: Vec<_> = graph
        .nodes()
        .filter(|(_, node)| node.producer() == &Producer::MarketData)
        .collect();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].1.target(), &usd());
    assert_eq!(graph.node_count(), 3);
    assert_eq!(inputs_of(&graph, &pv(1)), ["market data"]);
    assert_eq!(inputs_of(&graph, &pv(2)), ["market data"]);
}

#[test]
fn test_observed_value_narrowed_to_constraints() {
    let oracle = |requirement: &ValueRequirement| {
        (requirement.value_name() == "FxRate").then(|| {
            let properties = PropertySet::new().with("Currency", ["EUR", "USD"]);
            ValueSpecification::new("FxRate", requirement.target().clone(), properties)
        })
    };
    let engine = Engine::builder().market_data(oracle).finish();
    let rate = ValueRequirement::new("FxRate", usd())
        .with_constraints(PropertySet::new().with("Currency", ["USD"]));

    let graph = engine.build(&request([rate.clone()])).unwrap();

    assert_eq!(
        graph.terminal_output(&rate),
        Some(&ValueSpecification::new(
            "FxRate",
            usd(),
            PropertySet::new().with("Currency", ["USD"])
        ))
    );
}

#[test]
fn test_failing_candidate_falls_through() {
    let engine = engine(
        InMemoryRepository::new()
            .with(
                MockFunction::new("boom")
                    .priority(PriorityClass::High)
                    .produces("PresentValue")
                    .fails("boom"),
            )
            .with(MockFunction::new("good").produces("PresentValue")),
    );

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(producer_of(&graph, &pv(1)), Some("good"));
    assert!(graph.unsatisfied().is_empty());
    assert_eq!(graph.exceptions().len(), 1);

    let exception = &graph.exceptions()[0];
    assert_eq!(exception.target, swap(1));
    assert_eq!(exception.value_name, "PresentValue");
    assert_eq!(exception.function, "boom");
    assert_eq!(exception.message, "boom");

    let report = graph.to_report();
    assert_eq!(report.exception_count(), 1);
    assert_eq!(report.failure_count(), 0);
}

#[test]
fn test_failing_candidate_reported_once() {
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = calls.clone();
    let engine = Engine::builder()
        .repository(
            InMemoryRepository::new()
                .with(
                    MockFunction::new("boom")
                        .priority(PriorityClass::High)
                        .produces("Yield")
                        .requirements_with(move |_, _| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            anyhow::bail!("boom")
                        }),
                )
                .with(MockFunction::new("curve").produces("Yield"))
                .with(MockFunction::new("pv").produces("PresentValue").needs("Yield"))
                .with(MockFunction::new("delta").produces("Delta").needs("Yield")),
        )
        .options(BuildOptions {
            parallel: false,
            ..BuildOptions::default()
        })
        .finish();

    let graph = engine
        .build(&request([pv(1), ValueRequirement::new("Delta", swap(1))]))
        .unwrap();

    assert!(graph.unsatisfied().is_empty());
    assert_eq!(graph.exceptions().len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_candidate_is_recorded() {
    let engine = engine(
        InMemoryRepository::new()
            .with(
                MockFunction::new("panics")
                    .priority(PriorityClass::High)
                    .produces("PresentValue")
                    .results_with(|_, _| panic!("no curve")),
            )
            .with(MockFunction::new("good").produces("PresentValue")),
    );

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(producer_of(&graph, &pv(1)), Some("good"));
    assert_eq!(graph.exceptions()[0].message, "Function panicked: no curve");
}

#[test]
fn test_shared_sub_result() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv").produces("PresentValue").needs("Yield"))
            .with(MockFunction::new("delta").produces("Delta").needs("Yield"))
            .with(MockFunction::new("curve").produces("Yield")),
    );

    let graph = engine
        .build(&request([pv(1), ValueRequirement::new("Delta", swap(1))]))
        .unwrap();

    assert_eq!(count_producer(&graph, "curve"), 1);
    assert_eq!(graph.node_count(), 3);
    assert!(graph.is_acyclic());
}

#[test]
fn test_unsatisfiable_requirement_does_not_affect_others() {
    let engine = engine(
        InMemoryRepository::new().with(MockFunction::new("pv").produces("PresentValue")),
    );
    let gamma = ValueRequirement::new("Gamma", swap(1));

    let graph = engine.build(&request([gamma.clone(), pv(1)])).unwrap();

    assert_eq!(producer_of(&graph, &pv(1)), Some("pv"));
    assert_eq!(graph.unsatisfied().get(&gamma), Some(&UnsatisfiedReason::NoCandidate));
    assert!(graph.failure_trace(&gamma).unwrap().candidates.is_empty());

    let report = graph.to_report();
    assert_eq!(report.failure_count(), 1);
    assert_eq!(report.exception_count(), 0);
}

#[test]
fn test_siblings_never_share_a_group() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv").produces("PresentValue").needs("VolA").needs("VolB"))
            .with(MockFunction::new("fit-a").produces("VolA").group("VolFit"))
            .with(MockFunction::new("fit-b").produces("VolB").group("VolFit"))
            .with(MockFunction::new("flat-b").priority(PriorityClass::Low).produces("VolB")),
    );

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(inputs_of(&graph, &pv(1)), ["fit-a", "flat-b"]);
}

#[test]
fn test_sibling_conflict_without_alternative_fails_parent() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv").produces("PresentValue").needs("VolA").needs("VolB"))
            .with(MockFunction::new("fit-a").produces("VolA").group("VolFit"))
            .with(MockFunction::new("fit-b").produces("VolB").group("VolFit")),
    );

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(graph.unsatisfied().get(&pv(1)), Some(&UnsatisfiedReason::NoCandidate));
    assert_eq!(graph.node_count(), 0);

    let trace = graph.failure_trace(&pv(1)).unwrap();
    let skipped = trace.requirements();
    assert!(skipped.contains(&&ValueRequirement::new("VolA", swap(1))));
}

#[test]
fn test_group_assignment_applies_to_siblings() {
    let engine = Engine::builder()
        .repository(
            InMemoryRepository::new()
                .with(MockFunction::new("pv").produces("PresentValue").needs("VolA").needs("VolB"))
                .with(MockFunction::new("fit-a").produces("VolA"))
                .with(MockFunction::new("fit-b").produces("VolB"))
                .with(MockFunction::new("flat-b").priority(PriorityClass::Low).produces("VolB")),
        )
        .exclusion_groups(ExclusionGroups::new().assign("fit-a", "VolFit").assign("fit-b", "VolFit"))
        .finish();

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(inputs_of(&graph, &pv(1)), ["fit-a", "flat-b"]);
}

#[test]
fn test_same_function_may_serve_siblings() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv").produces("PresentValue").needs("VolA").needs("VolB"))
            .with(MockFunction::new("fit").produces("VolA").produces("VolB").group("VolFit")),
    );

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(inputs_of(&graph, &pv(1)), ["fit", "fit"]);
    assert_eq!(count_producer(&graph, "fit"), 1);

    let fit = graph.nodes().find(|(_, node)| node.function_id() == Some("fit")).unwrap().1;
    assert_eq!(fit.outputs().len(), 2);
}

#[test]
fn test_independent_branches_may_use_different_group_members() {
    // Under "pv" (VolFit) Vol can't come from "sabr"; on its own it can.
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv").produces("PresentValue").needs("Vol").group("VolFit"))
            .with(MockFunction::new("sabr").produces("Vol").group("VolFit"))
            .with(MockFunction::new("flat").priority(PriorityClass::Low).produces("Vol")),
    );
    let vol = ValueRequirement::new("Vol", swap(1));

    let graph = engine.build(&request([pv(1), vol.clone()])).unwrap();

    assert_eq!(inputs_of(&graph, &pv(1)), ["flat"]);
    assert_eq!(producer_of(&graph, &vol), Some("sabr"));
}

#[test]
fn test_budget_exceeded_is_distinct() {
    let repository = InMemoryRepository::new()
        .with(MockFunction::new("pv").produces("PresentValue").needs("Yield"))
        .with(MockFunction::new("curve").produces("Yield"));
    let engine = engine(repository);

    let token = CancelToken::new();
    token.cancel();

    let cases = [
        (Budget::new().with_cancel(token), BudgetLimit::Cancelled),
        (Budget::new().with_timeout(Duration::ZERO), BudgetLimit::Deadline),
        (Budget::new().with_max_nodes(0), BudgetLimit::NodeCount),
    ];

    for (budget, limit) in cases {
        let graph = engine.build_with_budget(&request([pv(1)]), &budget).unwrap();
        let reason = graph.unsatisfied().get(&pv(1)).unwrap();
        assert_eq!(reason, &UnsatisfiedReason::BudgetExceeded { limit });
        assert!(reason.is_budget_exceeded());
    }

    // Aborted resolutions are never memoized.
    let graph = engine.build(&request([pv(1)])).unwrap();
    assert_eq!(producer_of(&graph, &pv(1)), Some("pv"));
}

#[test]
fn test_budget_keeps_finished_requirements() {
    let engine = Engine::builder()
        .repository(InMemoryRepository::new().with(MockFunction::new("pv").produces("PresentValue")))
        .options(BuildOptions {
            parallel: false,
            ..BuildOptions::default()
        })
        .finish();

    let budget = Budget::new().with_max_nodes(1);
    let graph = engine
        .build_with_budget(&request([pv(1), pv(2)]), &budget)
        .unwrap();

    assert_eq!(producer_of(&graph, &pv(1)), Some("pv"));
    assert_eq!(
        graph.unsatisfied().get(&pv(2)),
        Some(&UnsatisfiedReason::BudgetExceeded {
            limit: BudgetLimit::NodeCount
        })
    );
}

#[test]
fn test_additional_requirements_become_inputs() {
    let engine = engine(
        InMemoryRepository::new()
            .with(
                MockFunction::new("pv")
                    .produces("PresentValue")
                    .additional_with(|target, _, _| {
                        Ok(BTreeSet::from([ValueRequirement::new("Yield", target.clone())]))
                    }),
            )
            .with(MockFunction::new("curve").produces("Yield")),
    );

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(inputs_of(&graph, &pv(1)), ["curve"]);
}

#[test]
fn test_unresolvable_additional_requirement_backtracks() {
    let engine = engine(
        InMemoryRepository::new()
            .with(
                MockFunction::new("pv")
                    .produces("PresentValue")
                    .additional_with(|target, _, _| {
                        Ok(BTreeSet::from([ValueRequirement::new("Missing", target.clone())]))
                    }),
            )
            .with(MockFunction::new("simple").priority(PriorityClass::Low).produces("PresentValue")),
    );

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(producer_of(&graph, &pv(1)), Some("simple"));
}

#[test]
fn test_function_constraint_selects_producer() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("a").priority(PriorityClass::High).produces("PresentValue"))
            .with(MockFunction::new("b").produces("PresentValue")),
    );
    let pinned = pv(1).with_constraints(PropertySet::new().with(FUNCTION_PROPERTY, ["b"]));

    let graph = engine.build(&request([pv(1), pinned.clone()])).unwrap();

    assert_eq!(producer_of(&graph, &pv(1)), Some("a"));
    assert_eq!(producer_of(&graph, &pinned), Some("b"));
    assert!(graph.terminal_output(&pinned).unwrap().properties().is_empty());
}

#[test]
fn test_defaults_fill_top_level_constraints() {
    let currency = |c: &str| PropertySet::new().with("Currency", [c]);
    let engine = engine(
        InMemoryRepository::new()
            .with(
                MockFunction::new("eur")
                    .priority(PriorityClass::High)
                    .produces_with("PresentValue", currency("EUR")),
            )
            .with(MockFunction::new("usd").produces_with("PresentValue", currency("USD"))),
    );

    let graph = engine
        .build(&request([pv(1)]).with_defaults(currency("USD")))
        .unwrap();

    let requirement = pv(1).with_constraints(currency("USD"));
    assert_eq!(producer_of(&graph, &requirement), Some("usd"));
    assert_eq!(
        graph.terminal_output(&requirement).unwrap().properties(),
        &currency("USD")
    );
}

#[test]
fn test_wildcard_output_narrowed_or_rejected() {
    let engine = engine(
        InMemoryRepository::new().with(
            MockFunction::new("pv").produces_with("PresentValue", PropertySet::new().with_any("Currency")),
        ),
    );
    let usd_pv = pv(1).with_constraints(PropertySet::new().with("Currency", ["USD"]));

    let graph = engine.build(&request([usd_pv.clone(), pv(2)])).unwrap();

    assert_eq!(
        graph.terminal_output(&usd_pv),
        Some(&ValueSpecification::new(
            "PresentValue",
            swap(1),
            PropertySet::new().with("Currency", ["USD"])
        ))
    );

    let trace = graph.failure_trace(&pv(2)).unwrap();
    assert_eq!(trace.candidates[0].outcome, CandidateOutcome::NoMatchingOutput);
}

#[test]
fn test_failure_reporting_off() {
    let engine = Engine::builder()
        .options(BuildOptions {
            failure_reporting: false,
            ..BuildOptions::default()
        })
        .finish();

    let graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(graph.unsatisfied().get(&pv(1)), Some(&UnsatisfiedReason::NoCandidate));
    assert!(graph.failure_trace(&pv(1)).is_none());
}

#[test]
fn test_contract_violations() {
    let engine = engine(InMemoryRepository::new());

    let err = engine.build(&BuildRequest::new(" ", at(1))).unwrap_err();
    assert!(matches!(err, EngineError::Contract(ContractError::EmptyConfigName)));

    let bad = request([pv(1), ValueRequirement::new("", swap(1))]);
    let err = engine.build(&bad).unwrap_err();
    assert!(matches!(err, EngineError::Contract(ContractError::EmptyValueName(1))));

    let bad = request([ValueRequirement::new(
        "PresentValue",
        TargetSpecification::latest(TargetType::Security, "Swap", ""),
    )]);
    let err = engine.build(&bad).unwrap_err();
    assert!(matches!(err, EngineError::Contract(ContractError::EmptyTargetIdentity(0))));

    // An empty batch is fine.
    assert_eq!(engine.build(&request([])).unwrap().node_count(), 0);
}

#[test]
fn test_catalogue_errors_surface() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv"))
            .with(MockFunction::new("pv")),
    );

    let err = engine.build(&request([pv(1)])).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Catalogue(CatalogueError::DuplicateFunction(ref id)) if id == "pv"
    ));
}

#[test]
fn test_request_from_json() {
    let json = r#"{
        "calculation_configuration": "Default",
        "valuation_time": "2024-01-01T12:00:00Z",
        "defaults": { "Currency": ["USD"] },
        "requirements": [
            {
                "value_name": "PresentValue",
                "target_type": "Security",
                "target": { "scheme": "Swap", "value": "1" }
            }
        ]
    }"#;

    let parsed: BuildRequest = serde_json::from_str(json).unwrap();
    let expected = request([pv(1)]).with_defaults(PropertySet::new().with("Currency", ["USD"]));
    assert_eq!(parsed, expected);
}

/// A catalogue exercising every resolution path: sharing, observable data,
/// exclusion groups on and off the path, failing candidates and cycles.
fn busy_engine(options: BuildOptions) -> Engine {
    let repository = InMemoryRepository::new()
        .with(MockFunction::new("pv").produces("PresentValue").needs("Yield").needs("Vol").group("Pricing"))
        .with(MockFunction::new("delta").produces("Delta").needs("PresentValue").needs("VolB"))
        .with(MockFunction::new("curve").produces("Yield").needs_on("Spot", usd()))
        .with(MockFunction::new("implied").priority(PriorityClass::High).produces("Yield").needs("PresentValue"))
        .with(MockFunction::new("sabr").produces("Vol").group("VolFit"))
        .with(MockFunction::new("sabr-b").produces("VolB").group("Pricing"))
        .with(MockFunction::new("flat-b").priority(PriorityClass::Low).produces("VolB"))
        .with(MockFunction::new("boom").priority(PriorityClass::Highest).produces("Vol").fails("boom"))
        .with(MockFunction::new("pricing-vol").priority(PriorityClass::High).produces("Vol").group("Pricing"));

    Engine::builder()
        .repository(repository)
        .market_data(FixedAvailability::new().with("Spot", usd(), PropertySet::new()))
        .options(options)
        .finish()
}

fn busy_request() -> BuildRequest {
    request((1..=12).flat_map(|n| {
        [
            ValueRequirement::new("Delta", swap(n)),
            pv(n),
            ValueRequirement::new("Vol", swap(n)),
            ValueRequirement::new("Gamma", swap(n)),
        ]
    }))
}

#[test]
fn test_busy_graph_shape() {
    let graph = busy_engine(BuildOptions::default()).build(&busy_request()).unwrap();

    assert!(graph.is_acyclic());
    assert_eq!(inputs_of(&graph, &pv(1)), ["sabr", "curve"]);
    assert_eq!(
        inputs_of(&graph, &ValueRequirement::new("Delta", swap(1))),
        ["pv", "flat-b"]
    );
    assert_eq!(
        producer_of(&graph, &ValueRequirement::new("Vol", swap(1))),
        Some("pricing-vol")
    );
    assert_eq!(count_producer(&graph, "pv"), 12);
    assert_eq!(graph.unsatisfied().len(), 12);
    assert_eq!(graph.exceptions().len(), 12);
}

#[test]
fn test_builds_are_deterministic() {
    let request = busy_request();
    let sequential = BuildOptions {
        parallel: false,
        ..BuildOptions::default()
    };

    let expected = busy_engine(sequential).build(&request).unwrap().fingerprint().unwrap();

    for _ in 0..4 {
        let engine = busy_engine(BuildOptions::default());
        for _ in 0..3 {
            let graph = engine.build(&request).unwrap();
            assert_eq!(graph.fingerprint().unwrap(), expected);
        }
    }
}

#[test]
fn test_concurrent_builds_share_the_memo() {
    let engine = busy_engine(BuildOptions::default());
    let request = busy_request();

    let fingerprints: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| engine.build(&request).unwrap().fingerprint().unwrap()))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(fingerprints.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(engine.memo_windows(), [day(1)]);
}

#[test]
fn test_roll_window_drops_old_state() {
    let catalogues = Arc::new(CatalogueCache::new());
    let engine = Engine::builder()
        .repository(InMemoryRepository::new().with(MockFunction::new("pv").produces("PresentValue")))
        .catalogue_cache(catalogues.clone())
        .finish();

    for n in [1, 2, 3] {
        let request = BuildRequest::new("Default", at(n)).with(pv(1));
        engine.build(&request).unwrap();
    }
    assert_eq!(engine.memo_windows(), [day(1), day(2), day(3)]);
    assert_eq!(catalogues.len(), 3);

    engine.roll_window(day(2));
    assert_eq!(engine.memo_windows(), [day(2), day(3)]);
    assert_eq!(catalogues.len(), 2);
}

#[test]
fn test_ambiguity_checker_from_engine() {
    let model = |m: &str| PropertySet::new().with("Model", [m]);
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("a").produces_with("PresentValue", model("A")))
            .with(MockFunction::new("b").produces_with("PresentValue", model("B"))),
    );

    let checker = engine.ambiguity_checker(day(1)).unwrap();
    let defects = checker.check(&[pv(1)]);
    assert_eq!(defects.len(), 1);
    assert_eq!(defects[0].functions, ["a", "b"]);

    // The builder still resolves, taking the first.
    let graph = engine.build(&request([pv(1)])).unwrap();
    assert_eq!(producer_of(&graph, &pv(1)), Some("a"));
}

#[test]
fn test_unnecessary_values_pruned_after_build() {
    let engine = engine(
        InMemoryRepository::new()
            .with(MockFunction::new("pv").produces("PresentValue").produces("Accrued").needs("Yield"))
            .with(MockFunction::new("curve").produces("Yield").produces("Discount")),
    );

    let mut graph = engine.build(&request([pv(1)])).unwrap();

    assert_eq!(graph.remove_unnecessary_values(), 2);
    let pv_node = graph.node(graph.terminal_node(&pv(1)).unwrap()).unwrap();
    assert_eq!(pv_node.outputs().len(), 1);
}
