use iql_core::{
    AggregateOp, CompileContext, FtgsCallback, GroupKey, GroupKeyMap, IqlError, MetricRegistry,
    PercentileCallback, Stat, StatOp, StatStack, Token, TopKCallback,
};
use proptest::prelude::*;
use std::collections::HashMap;

proptest! {
    #[test]
    fn bin_op_rejects_an_aggregate_anywhere(
        len in 1usize..6,
        position in 0usize..6,
        wrappers in prop::collection::vec(0u8..3, 0..4),
    ) {
        let position = position % len;
        let mut operands: Vec<Stat> = (0..len as i64).map(Stat::constant).collect();
        let agg = Stat::aggregate(AggregateOp::Add, Stat::count(), Stat::count()).unwrap();
        operands[position] = wrappers.iter().fold(agg, |inner, wrapper| match wrapper {
            0 => Stat::Exp(Box::new(inner)),
            1 => Stat::AbsoluteValue(Box::new(inner)),
            _ => Stat::Cached(Box::new(inner)),
        });
        let rejected = matches!(
            Stat::bin_op(StatOp::Add, operands),
            Err(IqlError::AggregateOperand { .. })
        );
        prop_assert!(rejected);
    }

    #[test]
    fn bin_op_token_count(len in 1usize..8) {
        let operands: Vec<Stat> = (0..len as i64).map(Stat::constant).collect();
        let stat = Stat::bin_op(StatOp::Multiply, operands).unwrap();
        let stack = StatStack::new();
        let metrics = MetricRegistry::new();
        let tokens = stat.compile(&CompileContext::new(&stack, &metrics)).unwrap();
        prop_assert_eq!(tokens.len(), 2 * len - 1);
        let operators = tokens.iter().filter(|t| matches!(t, Token::Operator(_))).count();
        prop_assert_eq!(operators, len - 1);
    }

    #[test]
    fn reference_offset_is_depth_minus_position_minus_one(depth in 1usize..12, pick in 0usize..12) {
        let pick = pick % depth;
        let mut stack = StatStack::new();
        let metrics = MetricRegistry::new();
        let refs: Vec<_> = (0..depth).map(|_| stack.push(&Stat::count())).collect();
        let tokens = Stat::reference(&refs[pick])
            .unwrap()
            .compile(&CompileContext::new(&stack, &metrics))
            .unwrap();
        prop_assert_eq!(tokens, vec![Token::Ref(depth - pick - 1)]);
    }

    #[test]
    fn top_k_matches_a_full_sort(
        scores in prop::collection::vec(-50i64..50, 0..40),
        k in 1usize..8,
        bottom in any::<bool>(),
    ) {
        let mut stack = StatStack::new();
        let sort = stack.push(&Stat::count());
        let keys = GroupKeyMap::from([(1, GroupKey::root())]);
        let mut callback = TopKCallback::new(k, bottom, sort, vec![], &keys);
        for (term, score) in scores.iter().enumerate() {
            callback.int_term_group("f", term as i64, 1, &[*score as f64]).unwrap();
        }
        let selected: Vec<String> = callback.finish().iter().map(|r| r.key.to_string()).collect();

        let mut expected: Vec<(i64, usize)> = scores
            .iter()
            .enumerate()
            .map(|(term, score)| (if bottom { *score } else { -*score }, term))
            .collect();
        expected.sort();
        let expected: Vec<String> = expected.iter().take(k).map(|(_, term)| term.to_string()).collect();
        prop_assert_eq!(selected, expected);
    }

    #[test]
    fn percentile_is_the_first_term_reaching_its_rank(
        counts in prop::collection::vec(1i64..5, 1..30),
        percentile in 1u32..=100,
    ) {
        let mut stack = StatStack::new();
        let count = stack.push(&Stat::count());
        let total: i64 = counts.iter().sum();
        let target = f64::from(percentile) / 100.0 * total as f64;
        let mut callback = PercentileCallback::new(count, HashMap::from([(1, vec![target])]));
        for (term, c) in counts.iter().enumerate() {
            callback.int_term_group("f", term as i64 * 10, 1, &[*c as f64]).unwrap();
        }
        prop_assert_eq!(callback.cumulative_count(1), total);

        let mut cumulative = 0;
        let mut expected = None;
        for (term, c) in counts.iter().enumerate() {
            cumulative += c;
            if cumulative as f64 >= target {
                expected = Some(term as i64 * 10);
                break;
            }
        }
        prop_assert_eq!(callback.finish()[&1].clone(), vec![expected.unwrap()]);
    }
}
