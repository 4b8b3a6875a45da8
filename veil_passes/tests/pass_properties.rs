//! Property tests over a corpus of generated functions
//!
//! Every pass must leave the module verifier-clean and observably
//! equivalent under the reference interpreter, for any seed and input.

use proptest::prelude::*;
use veil_ir::interp::{Machine, RtVal};
use veil_ir::{synth, verify_module, Module};
use veil_passes::{
    BogusFlowPass, FlatteningPass, ModulePass, Pipeline, StringObfuscationPass, SubstitutionPass,
};

fn run_synth(m: &Module, a: i32, b: i32) -> Option<RtVal> {
    Machine::new(m)
        .call("synth", &[RtVal::i32(a), RtVal::i32(b)])
        .expect("synth runs")
}

fn obfuscate_with(pipeline: &mut Pipeline, m: &Module) -> Module {
    let mut out = m.clone();
    pipeline.run(&mut out);
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_substitution_clean_and_equivalent(seed in any::<u64>(), a in any::<i32>(), b in any::<i32>()) {
        let original = synth::synth_module(seed);
        let mut pipeline = Pipeline::new();
        pipeline.add_function_pass(Box::new(SubstitutionPass::default()));
        let obf = obfuscate_with(&mut pipeline, &original);

        prop_assert!(verify_module(&obf).is_ok());
        prop_assert_eq!(run_synth(&original, a, b), run_synth(&obf, a, b));
    }

    #[test]
    fn prop_bogus_flow_clean_and_equivalent(seed in any::<u64>(), a in any::<i32>(), b in any::<i32>()) {
        let original = synth::synth_module(seed);
        let mut pipeline = Pipeline::new();
        pipeline.add_function_pass(Box::new(BogusFlowPass::new(100)));
        let obf = obfuscate_with(&mut pipeline, &original);

        prop_assert!(verify_module(&obf).is_ok());
        prop_assert_eq!(run_synth(&original, a, b), run_synth(&obf, a, b));
    }

    #[test]
    fn prop_flattening_clean_and_equivalent(seed in any::<u64>(), a in any::<i32>(), b in any::<i32>()) {
        let original = synth::synth_module(seed);
        let mut pipeline = Pipeline::new();
        pipeline.add_function_pass(Box::new(FlatteningPass::new()));
        let obf = obfuscate_with(&mut pipeline, &original);

        prop_assert!(verify_module(&obf).is_ok());
        prop_assert_eq!(run_synth(&original, a, b), run_synth(&obf, a, b));
    }

    #[test]
    fn prop_whole_pipeline(seed in any::<u64>(), a in any::<i32>(), b in any::<i32>()) {
        let original = synth::synth_module_with_string(seed);
        let mut pipeline = Pipeline::new();
        pipeline.add_module_pass(Box::new(StringObfuscationPass::new()));
        pipeline.add_function_pass(Box::new(SubstitutionPass::default()));
        pipeline.add_function_pass(Box::new(BogusFlowPass::default()));
        pipeline.add_function_pass(Box::new(FlatteningPass::new()));
        let obf = obfuscate_with(&mut pipeline, &original);

        prop_assert!(verify_module(&obf).is_ok());
        prop_assert_eq!(run_synth(&original, a, b), run_synth(&obf, a, b));

        let mut machine = Machine::new(&obf);
        machine.call("greet", &[]).expect("greet runs");
        prop_assert_eq!(machine.output(), "tell nobody\n");
    }

    #[test]
    fn prop_substitution_identities(a in any::<i32>(), b in any::<i32>(), r in any::<i32>()) {
        // a + b == a - (-b)
        prop_assert_eq!(a.wrapping_add(b), a.wrapping_sub(0i32.wrapping_sub(b)));
        // a + b == ((a + r) + b) - r
        prop_assert_eq!(a.wrapping_add(b), a.wrapping_add(r).wrapping_add(b).wrapping_sub(r));
        // a + b == -((-a) + (-b))
        prop_assert_eq!(
            a.wrapping_add(b),
            0i32.wrapping_sub(0i32.wrapping_sub(a).wrapping_add(0i32.wrapping_sub(b)))
        );
        // a - b == a + (-b)
        prop_assert_eq!(a.wrapping_sub(b), a.wrapping_add(0i32.wrapping_sub(b)));
        // a - b == ((a + r) - b) - r
        prop_assert_eq!(a.wrapping_sub(b), a.wrapping_add(r).wrapping_sub(b).wrapping_sub(r));
    }

    #[test]
    fn prop_opaque_predicate_true(x in any::<i32>()) {
        prop_assert_eq!(x.wrapping_mul(x.wrapping_add(1)).wrapping_rem(2), 0);
    }
}

/// The identities on the boundary values, where wrap-around actually bites,
/// plus a million random samples.
#[test]
fn test_identities_at_boundaries_and_samples() {
    fn check(a: i32, b: i32, r: i32) {
        assert_eq!(a.wrapping_add(b), a.wrapping_sub(0i32.wrapping_sub(b)));
        assert_eq!(
            a.wrapping_add(b),
            a.wrapping_add(r).wrapping_add(b).wrapping_sub(r)
        );
        assert_eq!(
            a.wrapping_add(b),
            0i32.wrapping_sub(0i32.wrapping_sub(a).wrapping_add(0i32.wrapping_sub(b)))
        );
        assert_eq!(a.wrapping_sub(b), a.wrapping_add(0i32.wrapping_sub(b)));
        assert_eq!(
            a.wrapping_sub(b),
            a.wrapping_add(r).wrapping_sub(b).wrapping_sub(r)
        );
    }

    let edge = [i32::MIN, i32::MIN + 1, -1, 0, 1, i32::MAX - 1, i32::MAX];
    for &a in &edge {
        for &b in &edge {
            for &r in &edge {
                check(a, b, r);
            }
        }
    }

    use rand::{rngs::StdRng, Rng, SeedableRng};
    let mut rng = StdRng::from_entropy();
    for _ in 0..1_000_000 {
        check(rng.gen(), rng.gen(), rng.gen());
    }
}

/// Decrypting an encrypted global restores the plaintext, and untouched
/// globals stay byte-identical.
#[test]
fn test_string_obfuscation_round_trip() {
    for seed in 0..16 {
        let original = synth::synth_module_with_string(seed);
        let mut obf = original.clone();
        let changed = StringObfuscationPass::new().run_on_module(&mut obf);
        assert!(changed, "seed {seed}: single-use string should qualify");
        verify_module(&obf).unwrap();

        let plain = original.globals.iter().find(|g| g.name == "msg").unwrap();
        let cipher = obf.globals.iter().find(|g| g.name == "msg").unwrap();
        let plain_bytes = plain.init.as_ref().unwrap().as_bytes().unwrap();
        let cipher_bytes = cipher.init.as_ref().unwrap().as_bytes().unwrap();

        assert!(!cipher.is_constant);
        assert_eq!(plain_bytes.len(), cipher_bytes.len());
        let decrypted: Vec<u8> = cipher_bytes[..cipher_bytes.len() - 1]
            .iter()
            .map(|b| b ^ 42)
            .chain(std::iter::once(0))
            .collect();
        assert_eq!(decrypted, plain_bytes);
    }
}

/// Bogus blocks hang off the false edge but the real path still reaches the
/// original code: in-degree >= 1, out-degree == 1, and the function entry
/// still reaches every original block.
#[test]
fn test_bogus_block_shape() {
    for seed in 0..16 {
        let original = synth::synth_module(seed);
        let mut obf = original.clone();
        let mut pipeline = Pipeline::new();
        pipeline.add_function_pass(Box::new(BogusFlowPass::new(100)));
        pipeline.run(&mut obf);
        verify_module(&obf).unwrap();

        let f = &obf.functions[0];
        for b in f.block_ids() {
            if f.block(b).name != "bogusBlock" {
                continue;
            }
            assert!(!f.predecessors(b).is_empty(), "seed {seed}: orphan bogus block");
            assert_eq!(f.successors(b).len(), 1, "seed {seed}: bogus out-degree");
        }

        // Reachability from the entry covers at least as many blocks as the
        // original function had.
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![f.entry()];
        while let Some(b) = stack.pop() {
            if seen.insert(b) {
                stack.extend(f.successors(b));
            }
        }
        assert!(seen.len() >= original.functions[0].num_blocks());
    }
}
