//! Assembler - executes a compiled program against a usage state
//!
//! One forward pass over the segment array with a second cursor over the
//! condition jump table. Output is only materialized once it diverges from
//! the normalized text (a skipped gate or a handler); otherwise the program
//! text is returned borrowed.

use crate::cache::PooledBuffer;
use crate::error::{Result, TemplateError};
use crate::template::compiler::group_size;
use crate::template::handler::Value;
use crate::template::program::CompiledProgram;
use crate::template::registry::Tier;
use crate::template::usage::UsageState;
use std::borrow::Cow;
use std::ops::{Deref, DerefMut};

/// Assemble with a usage state sized for the program's registry
pub fn assemble<'p, U>(program: &'p CompiledProgram, usage: &U) -> Result<Cow<'p, str>>
where
    U: UsageState + ?Sized,
{
    let expected = program.registry().len();
    if usage.len() != expected {
        return Err(TemplateError::UsageMismatch {
            expected,
            actual: usage.len(),
        });
    }
    run(program, |index| usage.is_active(index), |index| usage.value(index))
}

/// Assemble with closures: `predicate(index)` gates, `accessor(index)` handler values
pub fn assemble_with<'p, 'v, P, A>(program: &'p CompiledProgram, predicate: P, accessor: A) -> Result<Cow<'p, str>>
where
    P: Fn(usize) -> bool,
    A: Fn(usize) -> Option<&'v Value>,
{
    run(program, predicate, accessor)
}

/// Output buffer: exact-size for small results, pooled above the threshold
enum Scratch<'p> {
    Owned(String),
    Pooled(PooledBuffer<'p>),
}

impl<'p> Scratch<'p> {
    fn for_program(program: &'p CompiledProgram) -> Self {
        let estimate = program.estimator.estimate();
        if estimate < program.pooled_threshold {
            Scratch::Owned(String::with_capacity(estimate))
        } else {
            Scratch::Pooled(program.pool.acquire(estimate))
        }
    }

    /// The pooled path copies the result out so the scratch buffer goes back
    /// to the pool with its capacity; the returned `String` is the one
    /// output-sized allocation per call.
    fn into_string(self) -> String {
        match self {
            Scratch::Owned(buffer) => buffer,
            Scratch::Pooled(buffer) => buffer.as_str().to_owned(),
        }
    }
}

impl Deref for Scratch<'_> {
    type Target = String;

    fn deref(&self) -> &String {
        match self {
            Scratch::Owned(buffer) => buffer,
            Scratch::Pooled(buffer) => &**buffer,
        }
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut String {
        match self {
            Scratch::Owned(buffer) => buffer,
            Scratch::Pooled(buffer) => &mut **buffer,
        }
    }
}

/// Interpreter state for one call
struct Assembly<'p> {
    program: &'p CompiledProgram,
    out: Option<Scratch<'p>>,
    /// Literal text not yet copied to `out`
    run_start: usize,
    run_end: usize,
    /// Trim count of the last emitted literal segment
    last_excess: usize,
    /// A gate was skipped since the last emitted segment
    dirty_skip: bool,
}

impl<'p> Assembly<'p> {
    fn new(program: &'p CompiledProgram) -> Self {
        Self {
            program,
            out: None,
            run_start: 0,
            run_end: 0,
            last_excess: 0,
            dirty_skip: false,
        }
    }

    /// Materialize the buffer and copy the pending literal run into it
    fn flush(&mut self) -> &mut String {
        let program = self.program;
        let out = self.out.get_or_insert_with(|| Scratch::for_program(program));
        if self.run_end > self.run_start {
            out.push_str(&program.text[self.run_start..self.run_end]);
        }
        self.run_start = self.run_end;
        &mut **out
    }

    fn restart_run(&mut self, offset: usize) {
        self.run_start = offset;
        self.run_end = offset;
    }

    /// Remove the separator or keyword left dangling by skipped segments
    fn rewind(&mut self) {
        let excess = self.last_excess;
        let out = self.flush();
        let keep = out.len().saturating_sub(excess);
        if out.is_char_boundary(keep) {
            out.truncate(keep);
        }
        self.last_excess = 0;
        self.dirty_skip = false;
    }

    fn finish(mut self) -> Cow<'p, str> {
        let program = self.program;
        if self.out.is_none() {
            return Cow::Borrowed(program.text.as_str());
        }
        if self.dirty_skip {
            self.rewind();
        } else {
            self.flush();
        }
        match self.out.take() {
            Some(scratch) => Cow::Owned(scratch.into_string()),
            None => Cow::Borrowed(program.text.as_str()),
        }
    }
}

fn run<'p, 'v, P, A>(program: &'p CompiledProgram, predicate: P, accessor: A) -> Result<Cow<'p, str>>
where
    P: Fn(usize) -> bool,
    A: Fn(usize) -> Option<&'v Value>,
{
    let segments = &program.segments;
    let conditions = &program.conditions;
    let text_len = program.text.len();
    let special = program.registry().tiers().range(Tier::Special);
    // An empty multi-value list expands to nothing, so its gate is off
    let gate_on = |index: usize| {
        predicate(index) && !(special.contains(&index) && accessor(index).map_or(false, Value::is_empty_list))
    };
    let mut state = Assembly::new(program);

    let mut i = 0;
    let mut c = 0;
    while i < segments.len() {
        // Evaluate every gate anchored at this segment
        while let Some(condition) = conditions.get(c) {
            if condition.is_sentinel() || condition.segment_index != i {
                break;
            }
            let group = group_size(conditions, c);
            let active = conditions[c..c + group]
                .iter()
                .any(|member| gate_on(member.cond_index));
            if active {
                c += group;
                continue;
            }

            state.flush();
            state.dirty_skip = true;
            i += condition.length as usize;
            c += condition.nb_condition_skip.max(1) as usize;
            let resume = segments.get(i).map_or(text_len, |s| s.start);
            state.restart_run(resume);
        }
        if i >= segments.len() {
            break;
        }

        let segment = &segments[i];
        match &segment.handler {
            Some(handler) => {
                let index = segment.excess_or_index;
                let out = state.flush();
                let value = accessor(index).ok_or_else(|| TemplateError::MissingValue {
                    index,
                    name: program.registry().name(index).unwrap_or_default().to_string(),
                })?;
                handler.handle(out, value)?;
                state.last_excess = 0;
                state.dirty_skip = false;
                state.restart_run(segment.end());
            }
            None => {
                if state.dirty_skip && segment.is_section {
                    state.rewind();
                }
                state.dirty_skip = false;
                state.last_excess = segment.excess();
                state.run_end = segment.end();
            }
        }
        i += 1;
    }

    let result = state.finish();
    program.estimator.record(result.len());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemplateConfig;
    use crate::template::compiler::{compile, CompileOptions};
    use crate::template::handler::HandlerSet;
    use crate::template::usage::Bindings;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;

    fn compile_with_flags(text: &str, flags: &[&str]) -> CompiledProgram {
        let options = CompileOptions {
            flags: flags.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        };
        compile(text, &options).unwrap()
    }

    fn render(program: &CompiledProgram, enabled: &[&str]) -> String {
        let mut bindings = Bindings::new(program.registry());
        for name in enabled {
            bindings.enable(name).unwrap();
        }
        assemble(program, &bindings).unwrap().into_owned()
    }

    #[test]
    fn test_fast_path_borrows_program_text() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 /*A*/ AND a = 1 /*B*/ AND b = 2", &["A", "B"]);
        let mut bindings = Bindings::new(program.registry());
        bindings.enable("A").unwrap().enable("B").unwrap();

        let result = assemble(&program, &bindings).unwrap();
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result.as_ptr(), program.text().as_ptr());
        assert_eq!(program.pool.available(), 0);
    }

    #[test]
    fn test_no_marker_round_trip() {
        let program = compile_with_flags("SELECT a, b\n FROM T  WHERE a = 1 AND b IN (1, 2)", &[]);
        assert_eq!(program.text(), "SELECT a, b FROM T WHERE a = 1 AND b IN (1, 2)");
        let bindings = Bindings::new(program.registry());
        let result = assemble(&program, &bindings).unwrap();
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result, program.text());
    }

    #[test]
    fn test_and_drop() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 /*A*/ AND A=@A", &[]);
        let mut bindings = Bindings::new(program.registry());
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT * FROM T WHERE 1=1");

        bindings.set("A", 5i64).unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT * FROM T WHERE 1=1 AND A=@A");
    }

    #[test]
    fn test_or_group_short_circuits() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 /*A|B*/ AND x = 1", &["A", "B"]);
        let a = program.registry().index_of("A").unwrap();
        let b = program.registry().index_of("B").unwrap();

        let asked = RefCell::new(Vec::new());
        let accessed = RefCell::new(0);
        let result = assemble_with(
            &program,
            |index| {
                asked.borrow_mut().push(index);
                index == a
            },
            |_| {
                *accessed.borrow_mut() += 1;
                None
            },
        )
        .unwrap();
        assert_eq!(result, "SELECT * FROM T WHERE 1=1 AND x = 1");
        assert_eq!(result.matches("x = 1").count(), 1);
        assert_eq!(*asked.borrow(), vec![a]);
        assert_eq!(*accessed.borrow(), 0);

        assert_eq!(render(&program, &["B"]), "SELECT * FROM T WHERE 1=1 AND x = 1");
        assert_eq!(render(&program, &[]), "SELECT * FROM T WHERE 1=1");
        assert!(!asked.borrow().contains(&b));
    }

    #[test]
    fn test_and_combined_comment_needs_both() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 /*A&B*/ AND x = 1", &["A", "B"]);
        assert_eq!(render(&program, &["A"]), "SELECT * FROM T WHERE 1=1");
        assert_eq!(render(&program, &["B"]), "SELECT * FROM T WHERE 1=1");
        assert_eq!(render(&program, &["A", "B"]), "SELECT * FROM T WHERE 1=1 AND x = 1");
    }

    #[test]
    fn test_nested_drop_keeps_parentheses_balanced() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 AND ((?@A = a))", &[]);
        assert_eq!(render(&program, &[]), "SELECT * FROM T WHERE 1=1");

        let program = compile_with_flags("SELECT * FROM T WHERE x = 1 AND (a = 1 OR (?@B = b AND c = 2))", &[]);
        let output = render(&program, &[]);
        assert_eq!(output, "SELECT * FROM T WHERE x = 1 AND (a = 1 OR (c = 2))");
        assert_eq!(output.matches('(').count(), output.matches(')').count());
    }

    #[test]
    fn test_collapsed_group() {
        let program = compile_with_flags(
            "SELECT * FROM T WHERE x = 1 AND (a = 1 OR (/*B*/ b = 1 OR /*C*/ c = 1))",
            &["B", "C"],
        );
        assert_eq!(render(&program, &[]), "SELECT * FROM T WHERE x = 1 AND (a = 1)");
        assert_eq!(render(&program, &["B"]), "SELECT * FROM T WHERE x = 1 AND (a = 1 OR (b = 1))");
        assert_eq!(render(&program, &["C"]), "SELECT * FROM T WHERE x = 1 AND (a = 1 OR (c = 1))");
        assert_eq!(
            render(&program, &["B", "C"]),
            "SELECT * FROM T WHERE x = 1 AND (a = 1 OR (b = 1 OR c = 1))"
        );
    }

    #[test]
    fn test_where_disappears_when_all_items_drop() {
        let program = compile_with_flags("SELECT * FROM T WHERE ?@A = a AND ?@B = b ORDER BY x", &[]);
        assert_eq!(render(&program, &[]), "SELECT * FROM T ORDER BY x");

        let mut bindings = Bindings::new(program.registry());
        bindings.set("B", 1i64).unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT * FROM T WHERE @B = b ORDER BY x");

        let program = compile_with_flags("SELECT * FROM T WHERE ?@A = a", &[]);
        assert_eq!(render(&program, &[]), "SELECT * FROM T");
    }

    #[test]
    fn test_trailing_semicolon_trims_where() {
        let program = compile_with_flags("SELECT * FROM T WHERE ?@A = a;", &[]);
        assert_eq!(render(&program, &[]), "SELECT * FROM T;");

        let program = compile_with_flags("SELECT * FROM T WHERE x = 1 AND ?@A = a; SELECT 2", &[]);
        assert_eq!(render(&program, &[]), "SELECT * FROM T WHERE x = 1; SELECT 2");
    }

    #[test]
    fn test_section_gate_toggles_clause() {
        let program = compile_with_flags("SELECT * FROM T /*Sorted*/ ORDER BY Name DESC", &["Sorted"]);
        assert_eq!(render(&program, &[]), "SELECT * FROM T");
        assert_eq!(render(&program, &["Sorted"]), "SELECT * FROM T ORDER BY Name DESC");
    }

    #[test]
    fn test_multi_value_expansion() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 AND Id IN (@Items_M)", &[]);
        let mut bindings = Bindings::new(program.registry());

        bindings.set("Items", Vec::<i64>::new()).unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT * FROM T WHERE 1=1");

        bindings.set("Items", (1..=11i64).collect::<Vec<i64>>()).unwrap();
        let names: Vec<String> = (1..=11).map(|n| format!("@Items_{}", n)).collect();
        let expected = format!("SELECT * FROM T WHERE 1=1 AND Id IN ({})", names.join(", "));
        assert_eq!(assemble(&program, &bindings).unwrap(), expected);
        assert!(expected.contains("@Items_9, @Items_10, @Items_11)"));
    }

    #[test]
    fn test_sole_multi_value_item_drops_where() {
        let program = compile_with_flags("SELECT * FROM T WHERE Id IN (@Ids_M)", &[]);
        let mut bindings = Bindings::new(program.registry());
        bindings.set("Ids", Vec::<i64>::new()).unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT * FROM T");
    }

    #[test]
    fn test_handlers_format_values() {
        let program = compile_with_flags("SELECT * FROM T WHERE Title = @Title_Q AND Year > @Year_N", &[]);
        let mut bindings = Bindings::new(program.registry());
        bindings.set("Title", "Ann's").unwrap().set("Year", 1999i64).unwrap();
        assert_eq!(
            assemble(&program, &bindings).unwrap(),
            "SELECT * FROM T WHERE Title = 'Ann''s' AND Year > 1999"
        );
    }

    #[test]
    fn test_missing_handler_value_fails() {
        let program = compile_with_flags("SELECT * FROM T WHERE Title = @Title_Q", &[]);
        let bindings = Bindings::new(program.registry());
        let err = assemble(&program, &bindings).unwrap_err();
        assert!(matches!(err, TemplateError::MissingValue { ref name, .. } if name == "Title"));
    }

    #[test]
    fn test_usage_length_mismatch() {
        let program = compile_with_flags("SELECT * FROM T WHERE ?@A = a", &[]);
        let other = compile_with_flags("SELECT 1", &[]);
        let bindings = Bindings::new(other.registry());
        assert!(matches!(
            assemble(&program, &bindings),
            Err(TemplateError::UsageMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_pooled_buffer_returns_on_error() {
        let config = TemplateConfig::for_testing();
        let options = CompileOptions::from_config(&config, HandlerSet::with_builtins());
        let program = compile("SELECT * FROM T WHERE 1=1 AND Title = @Title_Q", &options).unwrap();
        let mut bindings = Bindings::new(program.registry());
        assert!(assemble(&program, &bindings).is_err());
        assert_eq!(program.pool.available(), 1);

        bindings.set("Title", "x").unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT * FROM T WHERE 1=1 AND Title = 'x'");
        assert_eq!(program.pool.available(), 1);
    }

    #[test]
    fn test_estimator_stops_after_window() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 /*A*/ AND a = 1", &["A"]);
        for n in 0..1100 {
            let enabled: &[&str] = if n % 3 == 0 { &["A"] } else { &[] };
            render(&program, enabled);
        }
        assert!(program.estimator().is_frozen());
        let frozen = program.estimator().estimate();
        for _ in 0..50 {
            render(&program, &["A"]);
        }
        assert_eq!(program.estimator().estimate(), frozen);
    }

    #[test]
    fn test_end_to_end_name_filter() {
        let program = compile_with_flags(
            "SELECT Id, Name FROM Users WHERE 1=1 /*NameFilter*/ AND Name = @NameFilter",
            &[],
        );
        let mut bindings = Bindings::new(program.registry());
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT Id, Name FROM Users WHERE 1=1");

        bindings.set("NameFilter", "Ann").unwrap();
        assert_eq!(
            assemble(&program, &bindings).unwrap(),
            "SELECT Id, Name FROM Users WHERE 1=1 AND Name = @NameFilter"
        );
    }

    #[test]
    fn test_column_toggling() {
        let options = CompileOptions::from_config(&TemplateConfig::for_column_toggling(), HandlerSet::with_builtins());
        let program = compile("SELECT Id, u.First&, u.Last, Email FROM Users u", &options).unwrap();
        let mut bindings = Bindings::new(program.registry());
        assert!(matches!(assemble(&program, &bindings).unwrap(), Cow::Borrowed(_)));

        bindings.disable("Last").unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT Id, Email FROM Users u");

        bindings.only_columns(&["Email"]).unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT Email FROM Users u");
    }

    #[test]
    fn test_gated_join_takes_its_on_clause() {
        let program = compile_with_flags("SELECT * FROM A /*J*/ LEFT JOIN B ON A.id = B.id WHERE A.x = 1", &["J"]);
        assert_eq!(render(&program, &[]), "SELECT * FROM A WHERE A.x = 1");
        assert_eq!(render(&program, &["J"]), "SELECT * FROM A LEFT JOIN B ON A.id = B.id WHERE A.x = 1");

        let program = compile_with_flags(
            "SELECT * FROM A /*J*/ JOIN B ON b = 1 /*K*/ INNER JOIN C ON c = 1 AND ?@D = d",
            &["J", "K"],
        );
        assert_eq!(render(&program, &[]), "SELECT * FROM A");
        assert_eq!(render(&program, &["J"]), "SELECT * FROM A JOIN B ON b = 1");
        assert_eq!(render(&program, &["K"]), "SELECT * FROM A INNER JOIN C ON c = 1");
    }

    #[test]
    fn test_gated_union_takes_following_select() {
        let program = compile_with_flags("SELECT a FROM T /*U*/ UNION SELECT a FROM U", &["U"]);
        assert_eq!(render(&program, &[]), "SELECT a FROM T");
        assert_eq!(render(&program, &["U"]), "SELECT a FROM T UNION SELECT a FROM U");

        let program = compile_with_flags(
            "SELECT a FROM T /*U*/ UNION ALL SELECT a FROM U WHERE ?@B = b; SELECT 1",
            &["U"],
        );
        assert_eq!(render(&program, &[]), "SELECT a FROM T; SELECT 1");
        assert_eq!(render(&program, &["U"]), "SELECT a FROM T UNION ALL SELECT a FROM U; SELECT 1");

        let program = compile_with_flags(
            "SELECT a FROM T /*U*/ UNION SELECT a FROM U /*V*/ UNION SELECT a FROM V",
            &["U", "V"],
        );
        assert_eq!(render(&program, &["V"]), "SELECT a FROM T UNION SELECT a FROM V");
    }

    #[test]
    fn test_optional_case_branches() {
        let program = compile_with_flags("SELECT CASE WHEN ?@A = 1 THEN 'x' ELSE 'y' END FROM T", &[]);
        let mut bindings = Bindings::new(program.registry());
        assert_eq!(assemble(&program, &bindings).unwrap(), "SELECT CASE ELSE 'y' END FROM T");
        bindings.set("A", 1i64).unwrap();
        assert_eq!(
            assemble(&program, &bindings).unwrap(),
            "SELECT CASE WHEN @A = 1 THEN 'x' ELSE 'y' END FROM T"
        );

        let program = compile_with_flags(
            "SELECT CASE /*A*/ WHEN a = 1 THEN 'x' WHEN b = 2 THEN ?@Y ELSE 'z' END AS k FROM T",
            &["A"],
        );
        assert_eq!(render(&program, &[]), "SELECT CASE ELSE 'z' END AS k FROM T");
        assert_eq!(render(&program, &["A"]), "SELECT CASE WHEN a = 1 THEN 'x' ELSE 'z' END AS k FROM T");
        let mut bindings = Bindings::new(program.registry());
        bindings.set("Y", "y").unwrap();
        assert_eq!(
            assemble(&program, &bindings).unwrap(),
            "SELECT CASE WHEN b = 2 THEN @Y ELSE 'z' END AS k FROM T"
        );

        let program = compile_with_flags("SELECT CASE WHEN a = 1 THEN 'x' ELSE ?@Z END FROM T", &[]);
        assert_eq!(render(&program, &[]), "SELECT CASE WHEN a = 1 THEN 'x' END FROM T");
    }

    #[test]
    fn test_set_items_drop_without_double_space() {
        let program = compile_with_flags("UPDATE T SET ?@a = a WHERE Id = 1", &[]);
        let output = render(&program, &[]);
        assert_eq!(output, "UPDATE T SET WHERE Id = 1");
        assert!(!output.contains("  "));

        let program = compile_with_flags("UPDATE T SET ?@A = a, ?@B = b WHERE Id = 1", &[]);
        let mut bindings = Bindings::new(program.registry());
        bindings.set("B", 2i64).unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "UPDATE T SET @B = b WHERE Id = 1");
        bindings.set("A", 1i64).unwrap().unset("B").unwrap();
        assert_eq!(assemble(&program, &bindings).unwrap(), "UPDATE T SET @A = a WHERE Id = 1");
    }

    #[test]
    fn test_group_by_drops_with_its_items() {
        let program = compile_with_flags("SELECT a, b FROM T GROUP BY /*A*/ a, /*B*/ b ORDER BY a", &["A", "B"]);
        assert_eq!(render(&program, &[]), "SELECT a, b FROM T ORDER BY a");
        assert_eq!(render(&program, &["A"]), "SELECT a, b FROM T GROUP BY a ORDER BY a");
        assert_eq!(render(&program, &["B"]), "SELECT a, b FROM T GROUP BY b ORDER BY a");

        let program = compile_with_flags("SELECT * FROM T /*G*/ GROUP BY a", &["G"]);
        assert_eq!(render(&program, &[]), "SELECT * FROM T");
    }

    #[test]
    fn test_empty_list_closes_gate_through_closures() {
        let program = compile_with_flags("SELECT * FROM T WHERE 1=1 AND Id IN (@Items_M)", &[]);
        let empty = Value::List(vec![]);
        assert_eq!(
            assemble_with(&program, |_| true, |_| Some(&empty)).unwrap(),
            "SELECT * FROM T WHERE 1=1"
        );

        let items = Value::List(vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(
            assemble_with(&program, |_| true, |_| Some(&items)).unwrap(),
            "SELECT * FROM T WHERE 1=1 AND Id IN (@Items_1, @Items_2)"
        );
    }

    /// One optional piece of a generated template
    struct Leaf {
        text: String,
        gate: Option<String>,
    }

    enum Item {
        Leaf(Leaf),
        Group(Vec<Leaf>),
    }

    /// Gated constructs generated around the WHERE clause
    struct Frame {
        branches: Option<Vec<Leaf>>,
        join: Option<Leaf>,
        tail: Option<Leaf>,
    }

    fn random_piece(rng: &mut StdRng, counter: &mut usize, flags: &mut Vec<String>, text: String) -> Leaf {
        let gate = rng.gen_bool(0.6).then(|| {
            let flag = format!("F{}", *counter);
            flags.push(flag.clone());
            flag
        });
        Leaf { text, gate }
    }

    fn random_leaf(rng: &mut StdRng, counter: &mut usize, flags: &mut Vec<String>) -> Leaf {
        *counter += 1;
        let text = format!("c{} = {}", *counter, *counter);
        random_piece(rng, counter, flags, text)
    }

    fn random_frame(rng: &mut StdRng, counter: &mut usize, flags: &mut Vec<String>) -> Frame {
        let branches = rng.gen_bool(0.4).then(|| {
            (0..rng.gen_range(1..4))
                .map(|_| {
                    *counter += 1;
                    let text = format!("WHEN w{} = {} THEN {}", *counter, *counter, *counter);
                    random_piece(rng, counter, flags, text)
                })
                .collect()
        });
        *counter += 1;
        let join = rng
            .gen_bool(0.4)
            .then(|| random_piece(rng, counter, flags, "LEFT JOIN J ON J.id = T.id".to_string()));
        *counter += 1;
        let tail = match rng.gen_range(0..3) {
            0 => None,
            1 => Some(random_piece(rng, counter, flags, "ORDER BY x".to_string())),
            _ => Some(random_piece(rng, counter, flags, "UNION SELECT * FROM U".to_string())),
        };
        Frame { branches, join, tail }
    }

    fn leaf_template(leaf: &Leaf) -> String {
        match &leaf.gate {
            Some(flag) => format!("/*{}*/ {}", flag, leaf.text),
            None => leaf.text.clone(),
        }
    }

    fn leaf_on(leaf: &Leaf, active: &[String]) -> bool {
        leaf.gate.as_ref().map_or(true, |flag| active.contains(flag))
    }

    /// Template text, or the expected output when `active` is given
    fn frame_text(frame: &Frame, where_clause: &str, active: Option<&[String]>) -> String {
        let show = |leaf: &Leaf| match active {
            Some(active) => leaf_on(leaf, active).then(|| leaf.text.clone()),
            None => Some(leaf_template(leaf)),
        };
        let mut out = String::from("SELECT ");
        match &frame.branches {
            Some(branches) => {
                out.push_str("CASE");
                for text in branches.iter().filter_map(show) {
                    out.push(' ');
                    out.push_str(&text);
                }
                out.push_str(" ELSE 0 END AS k");
            }
            None => out.push('*'),
        }
        out.push_str(" FROM T");
        for text in frame.join.iter().filter_map(show) {
            out.push(' ');
            out.push_str(&text);
        }
        if !where_clause.is_empty() {
            out.push_str(" WHERE ");
            out.push_str(where_clause);
        }
        for text in frame.tail.iter().filter_map(show) {
            out.push(' ');
            out.push_str(&text);
        }
        out
    }

    /// Reference renderer working on the generated structure, not the program
    fn expected_output(frame: &Frame, items: &[Item], active: &[String]) -> String {
        let mut kept = Vec::new();
        for item in items {
            match item {
                Item::Leaf(leaf) if leaf_on(leaf, active) => kept.push(leaf.text.clone()),
                Item::Leaf(_) => {}
                Item::Group(leaves) => {
                    let on: Vec<&str> = leaves
                        .iter()
                        .filter(|leaf| leaf_on(leaf, active))
                        .map(|leaf| leaf.text.as_str())
                        .collect();
                    if !on.is_empty() {
                        kept.push(format!("({})", on.join(" OR ")));
                    }
                }
            }
        }
        frame_text(frame, &kept.join(" AND "), Some(active))
    }

    #[test]
    fn test_random_templates_match_reference() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..300 {
            let mut counter = 0;
            let mut flags = Vec::new();
            let mut items = Vec::new();
            for _ in 0..rng.gen_range(1..6) {
                if rng.gen_bool(0.3) {
                    let size = rng.gen_range(1..4);
                    let leaves = (0..size).map(|_| random_leaf(&mut rng, &mut counter, &mut flags)).collect();
                    items.push(Item::Group(leaves));
                } else {
                    items.push(Item::Leaf(random_leaf(&mut rng, &mut counter, &mut flags)));
                }
            }
            let frame = random_frame(&mut rng, &mut counter, &mut flags);

            let clauses: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Item::Leaf(leaf) => leaf_template(leaf),
                    Item::Group(leaves) => {
                        let inner: Vec<String> = leaves.iter().map(leaf_template).collect();
                        format!("({})", inner.join(" OR "))
                    }
                })
                .collect();
            let template = frame_text(&frame, &clauses.join(" AND "), None);

            let flag_refs: Vec<&str> = flags.iter().map(String::as_str).collect();
            let program = compile_with_flags(&template, &flag_refs);

            for _ in 0..8 {
                let active: Vec<String> = flags.iter().filter(|_| rng.gen_bool(0.5)).cloned().collect();
                let enabled: Vec<&str> = active.iter().map(String::as_str).collect();
                let output = render(&program, &enabled);
                assert_eq!(output, expected_output(&frame, &items, &active), "template: {}", template);
                assert!(!output.contains("  "), "template: {}", template);
            }
        }
    }
}
