use std::fmt;

use super::{ConstantValue, Expression, LambdaExpression, NewObjectExpression, SortDirection, UnaryOp};
use crate::dynamic::DynamicValue;

fn fmt_dynamic(value: &DynamicValue, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        DynamicValue::Null => f.write_str("null"),
        DynamicValue::Bool(b) => write!(f, "{b}"),
        DynamicValue::Char(c) => write!(f, "{c:?}"),
        DynamicValue::String(s) => write!(f, "{s:?}"),
        DynamicValue::DateTime(d) => write!(f, "{}", d.to_rfc3339()),
        DynamicValue::Date(d) => write!(f, "{d}"),
        DynamicValue::Uuid(u) => write!(f, "{u}"),
        DynamicValue::Record(r) => match r.type_info() {
            Some(ty) => write!(f, "{{{ty}}}"),
            None => f.write_str("{record}"),
        },
        DynamicValue::List(items) => {
            f.write_str("[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                fmt_dynamic(item, f)?;
            }
            f.write_str("]")
        }
        other => match (other.as_i128(), other.as_f64()) {
            (Some(i), _) => write!(f, "{i}"),
            (None, Some(v)) => write!(f, "{v}"),
            _ => f.write_str("?"),
        },
    }
}

fn fmt_list(items: &[Expression], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn fmt_lambda(lambda: &LambdaExpression, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match lambda.parameters.as_slice() {
        [single] => f.write_str(&single.name)?,
        params => {
            let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
            write!(f, "({})", names.join(", "))?;
        }
    }
    write!(f, " => {}", lambda.body)
}

fn fmt_new(n: &NewObjectExpression, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &n.member_names {
        Some(names) => {
            f.write_str("new { ")?;
            for (i, (name, arg)) in names.iter().zip(&n.arguments).enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{name} = {arg}")?;
            }
            f.write_str(" }")
        }
        None => {
            write!(f, "new {}(", n.constructor.declaring_type)?;
            fmt_list(&n.arguments, f)?;
            f.write_str(")")
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant(c) => match &c.value {
                ConstantValue::Resource(r) => write!(f, "resource<{}>", r.element_type),
                ConstantValue::Literal(v) => fmt_dynamic(v, f),
            },
            Expression::Parameter(p) => f.write_str(&p.name),
            Expression::Member(m) => match &m.target {
                Some(t) => write!(f, "{t}.{}", m.member.name),
                None => write!(f, "{}.{}", m.member.declaring_type, m.member.name),
            },
            Expression::MethodCall(c) => match (&c.target, c.arguments.split_first()) {
                (Some(t), _) => {
                    write!(f, "{t}.{}(", c.method.name)?;
                    fmt_list(&c.arguments, f)?;
                    f.write_str(")")
                }
                (None, Some((first, rest))) => {
                    write!(f, "{first}.{}(", c.method.name)?;
                    fmt_list(rest, f)?;
                    f.write_str(")")
                }
                (None, None) => write!(f, "{}()", c.method),
            },
            Expression::Binary(b) => write!(f, "({} {} {})", b.left, b.op.symbol(), b.right),
            Expression::Unary(u) => match u.op {
                UnaryOp::Not => write!(f, "!{}", u.operand),
                UnaryOp::Negate => write!(f, "-{}", u.operand),
            },
            Expression::Conversion(c) => write!(f, "({}){}", c.target_type, c.operand),
            Expression::Conditional(c) => {
                write!(f, "({} ? {} : {})", c.test, c.if_true, c.if_false)
            }
            Expression::NewObject(n) => fmt_new(n, f),
            Expression::NewArray(a) => {
                write!(f, "new {}[] {{ ", a.element_type)?;
                fmt_list(&a.items, f)?;
                f.write_str(" }")
            }
            Expression::MemberInit(m) => {
                fmt_new(&m.new_object, f)?;
                f.write_str(" { ")?;
                for (i, b) in m.bindings.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {}", b.member.name, b.expression)?;
                }
                f.write_str(" }")
            }
            Expression::Collection(c) => {
                f.write_str("[")?;
                fmt_list(&c.items, f)?;
                f.write_str("]")
            }
            Expression::Lambda(l) => fmt_lambda(l, f),
            Expression::Sort(s) => {
                fmt_lambda(&s.operand, f)?;
                if s.direction == SortDirection::Descending {
                    f.write_str(" desc")?;
                }
                Ok(())
            }
            Expression::VariableArgument(v) => match (&v.value, &v.values) {
                (_, Some(values)) => {
                    f.write_str("$[")?;
                    for (i, item) in values.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        fmt_dynamic(item, f)?;
                    }
                    f.write_str("]")
                }
                (Some(value), None) => {
                    f.write_str("$(")?;
                    fmt_dynamic(value, f)?;
                    f.write_str(")")
                }
                (None, None) => f.write_str("$(null)"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{BinaryOp, VariableArgumentExpression};
    use crate::types::TypeInfo;

    #[test]
    fn test_display_variable_argument() {
        let arg = Expression::VariableArgument(VariableArgumentExpression::many(
            TypeInfo::named("i32"),
            vec![DynamicValue::I32(1), DynamicValue::I32(2)],
        ));
        let cmp = Expression::binary(
            BinaryOp::Equal,
            Expression::parameter("x", TypeInfo::named("i32")),
            Expression::VariableArgument(VariableArgumentExpression::single(
                TypeInfo::named("string"),
                DynamicValue::String("a".into()),
            )),
        );
        assert_eq!(arg.to_string(), "$[1, 2]");
        assert_eq!(cmp.to_string(), "(x == $(\"a\"))");
    }
}
