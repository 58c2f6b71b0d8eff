//! Branch pre-instrumenter: inserts `__branch__ = (src_line, dst_line)`
//! sentinel assignments at every control edge so the line-level probe
//! mechanism sees branches as distinct line events (§4.C).
//!
//! Grounded on `raya-parser`'s owned-tree shape (this crate deliberately
//! does not generalize a `MutVisitor` trait the way the immutable
//! [`covcore_ast::Visitor`] is generalized — each construct's rewrite is
//! different enough, in the shape of statements it produces, that a
//! generic fold would just be dispatch with extra ceremony).
//!
//! Scope cut (recorded in `DESIGN.md`): logical short-circuit operands and
//! conditional (ternary) expressions are only desugared when they appear
//! directly as an `if` condition, or as the RHS of an expression
//! statement / variable initializer / `return`, respectively — not when
//! buried inside an arbitrary larger expression (e.g. a call argument).
//! Doing so in general requires a sequence-point expression this syntax
//! tree does not model; the statement-position cases cover every example
//! in the source specification.

use std::collections::HashMap;

use covcore_ast::{
    walk_expression, walk_statement, walk_try_statement, AssignmentExpression, BlockStatement,
    CatchClause, DoWhileStatement, Expression, ExpressionStatement, ForStatement, Identifier,
    IfStatement, Literal, LiteralValue, LogicalExpression, LogicalOperator, Module,
    ReturnStatement, Span, Statement, SwitchCase, SwitchStatement, TryStatement, TupleExpression,
    VariableDecl, Visitor, WhileStatement, BRANCH_SENTINEL_NAME,
};

use crate::error::PreInstrumentError;

/// Output of a pre-instrumentation pass: the rewritten module plus a table
/// from each synthetic sentinel statement's own (synthetic) line to the
/// `(src_line, dst_line)` branch it records. The driver consults this
/// table when deciding whether a given source line is a line event or a
/// branch event once the host compiler has produced bytecode from
/// `module`.
pub struct PreInstrumented {
    /// The module with sentinel assignments inserted.
    pub module: Module,
    /// synthetic sentinel line -> (src_line, dst_line).
    pub branch_sites: HashMap<u32, (u32, u32)>,
}

#[derive(Debug, Clone, Copy)]
struct LoopCtx {
    header_line: u32,
    exit_line: u32,
}

struct Ctx {
    next_synthetic_line: u32,
    loop_stack: Vec<LoopCtx>,
    branch_sites: HashMap<u32, (u32, u32)>,
}

impl Ctx {
    fn alloc_synthetic_line(&mut self, src_line: u32, dst_line: u32) -> u32 {
        let line = self.next_synthetic_line;
        self.next_synthetic_line += 1;
        self.branch_sites.insert(line, (src_line, dst_line));
        line
    }
}

/// Walk `module`'s syntax tree before compilation and insert branch
/// sentinel assignments at every control edge.
///
/// Rejects the module outright if it already binds [`BRANCH_SENTINEL_NAME`]
/// anywhere, rather than rewriting it: the synthetic assignments this pass
/// inserts would otherwise collide with (and silently clobber) the user's
/// own binding (§4.C: "Synthetic assignments never shadow user bindings").
pub fn pre_instrument_module(module: Module) -> Result<PreInstrumented, PreInstrumentError> {
    if let Some(line) = find_sentinel_shadow(&module) {
        return Err(PreInstrumentError::SentinelNameShadowed {
            filename: module.filename,
            name: BRANCH_SENTINEL_NAME.to_string(),
            line,
        });
    }

    let mut ctx = Ctx {
        next_synthetic_line: highest_line(&module) + 1,
        loop_stack: Vec::new(),
        branch_sites: HashMap::new(),
    };
    let statements = instrument_block(module.statements, &mut ctx);
    Ok(PreInstrumented {
        module: Module { filename: module.filename, statements },
        branch_sites: ctx.branch_sites,
    })
}

/// Visitor that stops at the first statement or expression binding
/// [`BRANCH_SENTINEL_NAME`]. Overrides the three spots where the default
/// walk intentionally skips binding names (`VariableDecl`/`FunctionDecl`
/// names and parameters, a `catch` clause's parameter, and an assignment's
/// target) rather than relying on the read-only walk alone.
struct SentinelShadowScanner {
    found: Option<u32>,
}

impl Visitor for SentinelShadowScanner {
    fn visit_statement(&mut self, stmt: &Statement) {
        if self.found.is_some() {
            return;
        }
        match stmt {
            Statement::VariableDecl(vd) if vd.name == BRANCH_SENTINEL_NAME => {
                self.found = Some(vd.span.line());
                return;
            }
            Statement::FunctionDecl(fd)
                if fd.name == BRANCH_SENTINEL_NAME || fd.params.iter().any(|p| p == BRANCH_SENTINEL_NAME) =>
            {
                self.found = Some(fd.span.line());
                return;
            }
            _ => {}
        }
        walk_statement(self, stmt);
    }

    fn visit_try_statement(&mut self, stmt: &TryStatement) {
        if self.found.is_some() {
            return;
        }
        if let Some(clause) = &stmt.catch_clause {
            if clause.param.as_deref() == Some(BRANCH_SENTINEL_NAME) {
                self.found = Some(clause.span.line());
                return;
            }
        }
        walk_try_statement(self, stmt);
    }

    fn visit_expression(&mut self, expr: &Expression) {
        if self.found.is_some() {
            return;
        }
        if let Expression::Assignment(a) = expr {
            if let Expression::Identifier(id) = a.target.as_ref() {
                if id.name == BRANCH_SENTINEL_NAME {
                    self.found = Some(id.span.line());
                    return;
                }
            }
        }
        walk_expression(self, expr);
    }
}

fn find_sentinel_shadow(module: &Module) -> Option<u32> {
    let mut scanner = SentinelShadowScanner { found: None };
    scanner.visit_module(module);
    scanner.found
}

struct MaxLineFinder {
    max: u32,
}

impl Visitor for MaxLineFinder {
    fn visit_statement(&mut self, stmt: &Statement) {
        self.max = self.max.max(stmt.span().line());
        walk_statement(self, stmt);
    }

    fn visit_expression(&mut self, expr: &Expression) {
        self.max = self.max.max(expr.span().line());
        walk_expression(self, expr);
    }
}

fn highest_line(module: &Module) -> u32 {
    let mut finder = MaxLineFinder { max: 0 };
    finder.visit_module(module);
    finder.max
}

fn sentinel_stmt(ctx: &mut Ctx, src_line: u32, dst_line: u32) -> Statement {
    let synthetic_line = ctx.alloc_synthetic_line(src_line, dst_line);
    let span = Span::synthetic_at(synthetic_line);
    Statement::Expression(ExpressionStatement {
        expression: Expression::Assignment(AssignmentExpression {
            target: Box::new(Expression::Identifier(Identifier {
                name: BRANCH_SENTINEL_NAME.to_string(),
                span,
            })),
            value: Box::new(Expression::Tuple(TupleExpression {
                elements: vec![
                    Expression::Literal(Literal { value: LiteralValue::Int(src_line as i64), span }),
                    Expression::Literal(Literal { value: LiteralValue::Int(dst_line as i64), span }),
                ],
                span,
            })),
            span,
        }),
        span,
    })
}

/// Prepend `sentinel` to `stmt`, flattening into an existing block rather
/// than double-nesting one.
fn prepend_sentinel(stmt: Statement, sentinel: Statement) -> Statement {
    match stmt {
        Statement::Block(mut block) => {
            block.statements.insert(0, sentinel);
            Statement::Block(block)
        }
        other => {
            let span = other.span();
            Statement::Block(BlockStatement { statements: vec![sentinel, other], span })
        }
    }
}

fn instrument_block(stmts: Vec<Statement>, ctx: &mut Ctx) -> Vec<Statement> {
    let lines: Vec<u32> = stmts.iter().map(|s| s.span().line()).collect();
    let mut out = Vec::with_capacity(stmts.len());
    for (i, stmt) in stmts.into_iter().enumerate() {
        let next_line = lines.get(i + 1).copied();
        out.extend(instrument_statement(stmt, ctx, next_line));
    }
    out
}

/// Instrument a single statement that is not part of a larger list (a
/// branch target), collapsing a multi-statement result into one block.
fn instrument_owned_statement(stmt: Statement, ctx: &mut Ctx) -> Statement {
    let mut produced = instrument_statement(stmt, ctx, None);
    if produced.len() == 1 {
        produced.pop().unwrap()
    } else {
        let span = produced[0].span();
        Statement::Block(BlockStatement { statements: produced, span })
    }
}

fn instrument_statement(stmt: Statement, ctx: &mut Ctx, next_line: Option<u32>) -> Vec<Statement> {
    match stmt {
        Statement::If(if_stmt) => vec![instrument_if(if_stmt, ctx)],
        Statement::While(w) => instrument_while(w, ctx, next_line),
        Statement::DoWhile(d) => instrument_do_while(d, ctx, next_line),
        Statement::For(f) => instrument_for(f, ctx, next_line),
        Statement::Switch(s) => vec![instrument_switch(s, ctx)],
        Statement::Try(t) => vec![instrument_try(t, ctx)],
        Statement::Block(b) => {
            vec![Statement::Block(BlockStatement { statements: instrument_block(b.statements, ctx), span: b.span })]
        }
        Statement::FunctionDecl(mut f) => {
            let saved_loops = std::mem::take(&mut ctx.loop_stack);
            f.body.statements = instrument_block(f.body.statements, ctx);
            ctx.loop_stack = saved_loops;
            vec![Statement::FunctionDecl(f)]
        }
        Statement::Break(span) => {
            if let Some(loop_ctx) = ctx.loop_stack.last().copied() {
                vec![prepend_sentinel(
                    Statement::Break(span),
                    sentinel_stmt(ctx, loop_ctx.header_line, loop_ctx.exit_line),
                )]
            } else {
                vec![Statement::Break(span)]
            }
        }
        Statement::Expression(es) => vec![instrument_expression_statement(es, ctx)],
        Statement::VariableDecl(vd) => vec![instrument_variable_decl(vd, ctx)],
        Statement::Return(r) => vec![instrument_return(r, ctx)],
        Statement::Continue(span) => vec![Statement::Continue(span)],
    }
}

fn instrument_if(if_stmt: IfStatement, ctx: &mut Ctx) -> Statement {
    let src_line = if_stmt.condition.span().line();
    let then_dst = if_stmt.then_branch.span().line();
    let transformed_then = instrument_owned_statement(*if_stmt.then_branch, ctx);
    let then_wrapped = prepend_sentinel(transformed_then, sentinel_stmt(ctx, src_line, then_dst));

    let else_wrapped = if_stmt.else_branch.map(|else_box| {
        let else_dst = else_box.span().line();
        let transformed_else = instrument_owned_statement(*else_box, ctx);
        prepend_sentinel(transformed_else, sentinel_stmt(ctx, src_line, else_dst))
    });

    build_conditional(if_stmt.condition, then_wrapped, else_wrapped, if_stmt.span, ctx)
}

/// Build the `if` node for `condition`, desugaring a non-collapsing
/// top-level `&&`/`||` into nested `if`s so each operand's truthiness
/// gets its own sentinel, per §4.C's short-circuit rule.
fn build_conditional(
    condition: Expression,
    then_branch: Statement,
    else_branch: Option<Statement>,
    outer_span: Span,
    ctx: &mut Ctx,
) -> Statement {
    match condition {
        Expression::Logical(LogicalExpression { operator, left, right, .. })
            if !left.is_statically_constant_truthiness() && !right.is_statically_constant_truthiness() =>
        {
            let left_line = left.span().line();
            let right_line = right.span().line();
            let inner_if =
                build_conditional(*right, then_branch.clone(), else_branch.clone(), outer_span, ctx);
            let guarded_inner = prepend_sentinel(inner_if, sentinel_stmt(ctx, left_line, right_line));
            match operator {
                LogicalOperator::And => Statement::If(IfStatement {
                    condition: *left,
                    then_branch: Box::new(guarded_inner),
                    else_branch: else_branch.map(Box::new),
                    span: outer_span,
                }),
                LogicalOperator::Or => Statement::If(IfStatement {
                    condition: *left,
                    then_branch: Box::new(then_branch),
                    else_branch: Some(Box::new(guarded_inner)),
                    span: outer_span,
                }),
            }
        }
        other => Statement::If(IfStatement {
            condition: other,
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
            span: outer_span,
        }),
    }
}

fn instrument_while(w: WhileStatement, ctx: &mut Ctx, next_line: Option<u32>) -> Vec<Statement> {
    let src_line = w.condition.span().line();
    let body_dst = w.body.span().line();
    let exit_dst = next_line.unwrap_or(w.span.end_line + 1);

    ctx.loop_stack.push(LoopCtx { header_line: src_line, exit_line: exit_dst });
    let transformed_body = instrument_owned_statement(*w.body, ctx);
    ctx.loop_stack.pop();

    let wrapped_body = prepend_sentinel(transformed_body, sentinel_stmt(ctx, src_line, body_dst));
    let new_while = Statement::While(WhileStatement { condition: w.condition, body: Box::new(wrapped_body), span: w.span });
    let exit_sentinel = sentinel_stmt(ctx, src_line, exit_dst);
    vec![new_while, exit_sentinel]
}

fn instrument_do_while(d: DoWhileStatement, ctx: &mut Ctx, next_line: Option<u32>) -> Vec<Statement> {
    let src_line = d.condition.span().line();
    let body_dst = d.body.span().line();
    let exit_dst = next_line.unwrap_or(d.span.end_line + 1);

    ctx.loop_stack.push(LoopCtx { header_line: src_line, exit_line: exit_dst });
    let transformed_body = instrument_owned_statement(*d.body, ctx);
    ctx.loop_stack.pop();

    let wrapped_body = prepend_sentinel(transformed_body, sentinel_stmt(ctx, src_line, body_dst));
    let new_do_while = Statement::DoWhile(DoWhileStatement {
        body: Box::new(wrapped_body),
        condition: d.condition,
        span: d.span,
    });
    let exit_sentinel = sentinel_stmt(ctx, src_line, exit_dst);
    vec![new_do_while, exit_sentinel]
}

fn instrument_for(f: ForStatement, ctx: &mut Ctx, next_line: Option<u32>) -> Vec<Statement> {
    let exit_dst = next_line.unwrap_or(f.span.end_line + 1);
    let src_line = f.test.as_ref().map(|t| t.span().line()).unwrap_or_else(|| f.span.line());
    let body_dst = f.body.span().line();
    let has_condition = f.test.is_some();

    ctx.loop_stack.push(LoopCtx { header_line: src_line, exit_line: exit_dst });
    let transformed_body = instrument_owned_statement(*f.body, ctx);
    ctx.loop_stack.pop();

    let wrapped_body = prepend_sentinel(transformed_body, sentinel_stmt(ctx, src_line, body_dst));
    let new_for = Statement::For(ForStatement {
        init: f.init,
        test: f.test,
        update: f.update,
        body: Box::new(wrapped_body),
        span: f.span,
    });

    if has_condition {
        vec![new_for, sentinel_stmt(ctx, src_line, exit_dst)]
    } else {
        vec![new_for]
    }
}

fn instrument_switch(s: SwitchStatement, ctx: &mut Ctx) -> Statement {
    let src_line = s.discriminant.span().line();
    let new_cases = s
        .cases
        .into_iter()
        .map(|case| {
            let dst_line = case.consequent.first().map(|st| st.span().line()).unwrap_or_else(|| case.span.line());
            let mut new_consequent = instrument_block(case.consequent, ctx);
            new_consequent.insert(0, sentinel_stmt(ctx, src_line, dst_line));
            SwitchCase { test: case.test, consequent: new_consequent, span: case.span }
        })
        .collect();
    Statement::Switch(SwitchStatement { discriminant: s.discriminant, cases: new_cases, span: s.span })
}

fn instrument_try(t: TryStatement, ctx: &mut Ctx) -> Statement {
    let body = BlockStatement { statements: instrument_block(t.body.statements, ctx), span: t.body.span };
    let src_line = t.span.line();

    let catch_clause = t.catch_clause.map(|clause| {
        let dst_line = clause
            .body
            .statements
            .first()
            .map(|s| s.span().line())
            .unwrap_or_else(|| clause.body.span.line());
        let mut new_stmts = instrument_block(clause.body.statements, ctx);
        new_stmts.insert(0, sentinel_stmt(ctx, src_line, dst_line));
        CatchClause {
            param: clause.param,
            body: BlockStatement { statements: new_stmts, span: clause.body.span },
            span: clause.span,
        }
    });

    let finally_clause = t
        .finally_clause
        .map(|f| BlockStatement { statements: instrument_block(f.statements, ctx), span: f.span });

    Statement::Try(TryStatement { body, catch_clause, finally_clause, span: t.span })
}

fn instrument_expression_statement(es: ExpressionStatement, ctx: &mut Ctx) -> Statement {
    let span = es.span;
    match es.expression {
        Expression::Conditional(cond) => desugar_ternary(*cond.test, *cond.consequent, *cond.alternate, span, ctx, move |value| {
            Statement::Expression(ExpressionStatement { expression: value, span })
        }),
        other => Statement::Expression(ExpressionStatement { expression: other, span }),
    }
}

fn instrument_variable_decl(vd: VariableDecl, ctx: &mut Ctx) -> Statement {
    let VariableDecl { name, init, span } = vd;
    match init {
        Some(Expression::Conditional(cond)) => {
            let name = name.clone();
            desugar_ternary(*cond.test, *cond.consequent, *cond.alternate, span, ctx, move |value| {
                Statement::VariableDecl(VariableDecl { name: name.clone(), init: Some(value), span })
            })
        }
        other => Statement::VariableDecl(VariableDecl { name, init: other, span }),
    }
}

fn instrument_return(r: ReturnStatement, ctx: &mut Ctx) -> Statement {
    let ReturnStatement { argument, span } = r;
    match argument {
        Some(Expression::Conditional(cond)) => {
            desugar_ternary(*cond.test, *cond.consequent, *cond.alternate, span, ctx, move |value| {
                Statement::Return(ReturnStatement { argument: Some(value), span })
            })
        }
        other => Statement::Return(ReturnStatement { argument: other, span }),
    }
}

fn desugar_ternary(
    test: Expression,
    consequent: Expression,
    alternate: Expression,
    outer_span: Span,
    ctx: &mut Ctx,
    rebuild: impl Fn(Expression) -> Statement,
) -> Statement {
    let t_line = test.span().line();
    let c_line = consequent.span().line();
    let a_line = alternate.span().line();
    let then_branch = prepend_sentinel(rebuild(consequent), sentinel_stmt(ctx, t_line, c_line));
    let else_branch = prepend_sentinel(rebuild(alternate), sentinel_stmt(ctx, t_line, a_line));
    Statement::If(IfStatement {
        condition: test,
        then_branch: Box::new(then_branch),
        else_branch: Some(Box::new(else_branch)),
        span: outer_span,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use covcore_ast::{BinaryExpression, BinaryOperator};

    fn span_at(line: u32) -> Span {
        Span::new(line, 0, line, 1)
    }

    fn ident(name: &str, line: u32) -> Expression {
        Expression::Identifier(Identifier { name: name.into(), span: span_at(line) })
    }

    fn truthy_cmp(line: u32) -> Expression {
        Expression::Binary(BinaryExpression {
            operator: BinaryOperator::GreaterThan,
            left: Box::new(ident("n", line)),
            right: Box::new(Expression::Literal(Literal { value: LiteralValue::Int(0), span: span_at(line) })),
            span: span_at(line),
        })
    }

    /// `while (n>0) { x+=n; n-=1; } return x;` spanning lines 3..6,
    /// matching S1/S2's literal example.
    fn loop_module() -> Module {
        let body = Statement::Block(BlockStatement {
            statements: vec![
                Statement::Expression(ExpressionStatement { expression: ident("x_plus_eq_n", 4), span: span_at(4) }),
                Statement::Expression(ExpressionStatement { expression: ident("n_minus_eq_1", 5), span: span_at(5) }),
            ],
            span: Span::new(4, 0, 5, 1),
        });
        let while_stmt = Statement::While(WhileStatement {
            condition: truthy_cmp(3),
            body: Box::new(body),
            span: Span::new(3, 0, 5, 1),
        });
        let ret = Statement::Return(ReturnStatement {
            argument: Some(ident("x", 6)),
            span: span_at(6),
        });
        Module { filename: "f.src".into(), statements: vec![while_stmt, ret] }
    }

    #[test]
    fn while_loop_gets_body_and_exit_sentinels() {
        let result = pre_instrument_module(loop_module()).unwrap();
        // [While, exit-sentinel, Return]
        assert_eq!(result.module.statements.len(), 3);
        assert!(matches!(result.module.statements[0], Statement::While(_)));
        assert!(matches!(result.module.statements[1], Statement::Expression(_)));
        assert!(matches!(result.module.statements[2], Statement::Return(_)));

        let exit_site = result
            .branch_sites
            .values()
            .find(|&&(src, dst)| src == 3 && dst == 6)
            .copied();
        assert_eq!(exit_site, Some((3, 6)), "normal loop exit must record (3,6)");

        let body_site = result
            .branch_sites
            .values()
            .find(|&&(src, dst)| src == 3 && dst == 4)
            .copied();
        assert_eq!(body_site, Some((3, 4)), "loop body entry must record (3,4)");
    }

    #[test]
    fn if_without_else_instruments_only_the_taken_branch() {
        let then_branch = Statement::Expression(ExpressionStatement { expression: ident("y", 2), span: span_at(2) });
        let if_stmt = Statement::If(IfStatement {
            condition: truthy_cmp(1),
            then_branch: Box::new(then_branch),
            else_branch: None,
            span: Span::new(1, 0, 2, 1),
        });
        let module = Module { filename: "t.src".into(), statements: vec![if_stmt] };
        let result = pre_instrument_module(module).unwrap();
        assert_eq!(result.branch_sites.len(), 1);
        assert_eq!(result.branch_sites.values().next().copied(), Some((1, 2)));
    }

    #[test]
    fn and_expression_desugars_into_nested_if_with_its_own_sentinel() {
        let condition = Expression::Logical(LogicalExpression {
            operator: LogicalOperator::And,
            left: Box::new(ident("a", 1)),
            right: Box::new(ident("b", 1)),
            span: span_at(1),
        });
        let then_branch = Statement::Expression(ExpressionStatement { expression: ident("y", 2), span: span_at(2) });
        let if_stmt = Statement::If(IfStatement {
            condition,
            then_branch: Box::new(then_branch),
            else_branch: None,
            span: Span::new(1, 0, 2, 1),
        });
        let module = Module { filename: "t.src".into(), statements: vec![if_stmt] };
        let result = pre_instrument_module(module).unwrap();

        // One sentinel for the a->b short-circuit edge, one for the
        // outer if's taken branch.
        assert_eq!(result.branch_sites.len(), 2);
        assert!(matches!(result.module.statements[0], Statement::If(_)));
        if let Statement::If(outer) = &result.module.statements[0] {
            assert!(matches!(*outer.then_branch, Statement::Block(_)));
        }
    }

    #[test]
    fn statically_constant_operand_is_not_desugared() {
        let condition = Expression::Logical(LogicalExpression {
            operator: LogicalOperator::Or,
            left: Box::new(Expression::Literal(Literal { value: LiteralValue::Bool(false), span: span_at(1) })),
            right: Box::new(ident("b", 1)),
            span: span_at(1),
        });
        let then_branch = Statement::Expression(ExpressionStatement { expression: ident("y", 2), span: span_at(2) });
        let if_stmt = Statement::If(IfStatement {
            condition,
            then_branch: Box::new(then_branch),
            else_branch: None,
            span: Span::new(1, 0, 2, 1),
        });
        let module = Module { filename: "t.src".into(), statements: vec![if_stmt] };
        let result = pre_instrument_module(module).unwrap();
        // Only the outer if's branch sentinel, no short-circuit desugar.
        assert_eq!(result.branch_sites.len(), 1);
    }

    #[test]
    fn break_inside_loop_records_loop_header_to_exit_edge() {
        let break_stmt = Statement::Break(span_at(4));
        let body = Statement::Block(BlockStatement { statements: vec![break_stmt], span: span_at(4) });
        let while_stmt = Statement::While(WhileStatement {
            condition: truthy_cmp(3),
            body: Box::new(body),
            span: Span::new(3, 0, 4, 1),
        });
        let after = Statement::Expression(ExpressionStatement { expression: ident("done", 5), span: span_at(5) });
        let module = Module { filename: "t.src".into(), statements: vec![while_stmt, after] };
        let result = pre_instrument_module(module).unwrap();
        let break_edge = result.branch_sites.values().find(|&&(src, dst)| src == 3 && dst == 5);
        assert_eq!(break_edge, Some(&(3, 5)));
    }

    #[test]
    fn variable_named_like_the_sentinel_is_rejected() {
        let decl = Statement::VariableDecl(VariableDecl {
            name: BRANCH_SENTINEL_NAME.to_string(),
            init: None,
            span: span_at(1),
        });
        let module = Module { filename: "t.src".into(), statements: vec![decl] };
        let err = pre_instrument_module(module).unwrap_err();
        assert_eq!(
            err,
            PreInstrumentError::SentinelNameShadowed {
                filename: "t.src".to_string(),
                name: BRANCH_SENTINEL_NAME.to_string(),
                line: 1,
            }
        );
    }

    #[test]
    fn function_parameter_named_like_the_sentinel_is_rejected() {
        let fn_decl = Statement::FunctionDecl(covcore_ast::FunctionDecl {
            name: "f".to_string(),
            params: vec![BRANCH_SENTINEL_NAME.to_string()],
            body: BlockStatement { statements: Vec::new(), span: span_at(1) },
            span: span_at(1),
        });
        let module = Module { filename: "t.src".into(), statements: vec![fn_decl] };
        assert!(pre_instrument_module(module).is_err());
    }

    #[test]
    fn assignment_to_the_sentinel_name_is_rejected() {
        let assign = Statement::Expression(ExpressionStatement {
            expression: Expression::Assignment(AssignmentExpression {
                target: Box::new(ident(BRANCH_SENTINEL_NAME, 2)),
                value: Box::new(Expression::Literal(Literal { value: LiteralValue::Int(1), span: span_at(2) })),
                span: span_at(2),
            }),
            span: span_at(2),
        });
        let module = Module { filename: "t.src".into(), statements: vec![assign] };
        let err = pre_instrument_module(module).unwrap_err();
        assert_eq!(
            err,
            PreInstrumentError::SentinelNameShadowed {
                filename: "t.src".to_string(),
                name: BRANCH_SENTINEL_NAME.to_string(),
                line: 2,
            }
        );
    }

    #[test]
    fn ordinary_modules_are_unaffected_by_the_shadow_check() {
        assert!(find_sentinel_shadow(&loop_module()).is_none());
    }
}
