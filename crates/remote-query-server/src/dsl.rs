//! A small textual query language for the CLI and REPL.
//!
//! ```text
//! FROM Order
//!   [WHERE Total > 10 AND Customer.Name = 'Ada']
//!   [ORDER BY Total DESC, Id]
//!   [SKIP 5] [TAKE 10]
//! ```
//!
//! Each `AND`-joined condition becomes one filter of a [`QueryDescriptor`].
//! Literals take the type of the member they are compared with.

use remote_query::expression::{BinaryOp, LambdaExpression, ParameterExpression, SortDirection};
use remote_query::types::MemberInfo;
use remote_query::{DynamicObjectMapper, DynamicValue, Expression, NativeType, QueryDescriptor, TypeRegistry};

use crate::types::{ServerError, ServerResult};

const PARAM: &str = "x";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(String),
    Op(String),
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Str(s) => format!("'{s}'"),
            Token::Num(n) => n.clone(),
            Token::Op(o) => o.clone(),
            Token::Comma => ",".to_string(),
        }
    }
}

fn syntax(msg: impl Into<String>) -> ServerError {
    ServerError::InvalidRequest(msg.into())
}

fn tokenize(text: &str) -> ServerResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == ',' {
            chars.next();
            tokens.push(Token::Comma);
        } else if c == '\'' || c == '"' {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some(ch) if ch == c => break,
                    Some(ch) => s.push(ch),
                    None => return Err(syntax("Unterminated string literal")),
                }
            }
            tokens.push(Token::Str(s));
        } else if "=!<>".contains(c) {
            let mut op = String::new();
            while let Some(&ch) = chars.peek() {
                if !"=!<>".contains(ch) {
                    break;
                }
                op.push(ch);
                chars.next();
            }
            tokens.push(Token::Op(op));
        } else if c.is_ascii_digit() || c == '-' {
            let mut n = String::new();
            n.push(c);
            chars.next();
            while let Some(&ch) = chars.peek() {
                if !(ch.is_ascii_digit() || ch == '.') {
                    break;
                }
                n.push(ch);
                chars.next();
            }
            tokens.push(Token::Num(n));
        } else if c.is_alphabetic() || c == '_' {
            let mut w = String::new();
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_' || ch == '.') {
                    break;
                }
                w.push(ch);
                chars.next();
            }
            tokens.push(Token::Word(w));
        } else {
            return Err(syntax(format!("Unexpected character '{c}'")));
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    element: NativeType,
    mapper: &'a DynamicObjectMapper,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next_token(&mut self) -> ServerResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| syntax("Unexpected end of query"))?;
        self.pos += 1;
        Ok(token)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> ServerResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            let found = self.peek().map(Token::describe).unwrap_or_else(|| "end of query".into());
            Err(syntax(format!("Expected {keyword}, found {found}")))
        }
    }

    fn word(&mut self) -> ServerResult<String> {
        match self.next_token()? {
            Token::Word(w) => Ok(w),
            other => Err(syntax(format!("Expected a name, found {}", other.describe()))),
        }
    }

    fn count(&mut self) -> ServerResult<i32> {
        match self.next_token()? {
            Token::Num(n) => n
                .parse::<i32>()
                .ok()
                .filter(|n| *n >= 0)
                .ok_or_else(|| syntax(format!("'{n}' is not a row count"))),
            other => Err(syntax(format!("Expected a number, found {}", other.describe()))),
        }
    }

    /// `x.A.B`, typed by walking the member chain.
    fn member_path(&self, path: &str) -> ServerResult<(Expression, NativeType)> {
        let mut expr = Expression::parameter(PARAM, self.element.descriptor());
        let mut ty = self.element.clone();
        for segment in path.split('.') {
            let member_type = ty
                .member_type(segment)
                .ok_or_else(|| syntax(format!("'{ty}' has no member '{segment}'")))?;
            expr = Expression::member(
                expr,
                MemberInfo {
                    declaring_type: ty.descriptor(),
                    name: segment.to_string(),
                    member_type: member_type.descriptor(),
                },
            );
            ty = member_type;
        }
        Ok((expr, ty))
    }

    fn literal(&mut self, ty: &NativeType) -> ServerResult<Expression> {
        let raw = match self.next_token()? {
            Token::Str(s) => DynamicValue::String(s),
            Token::Num(n) => match n.parse::<i64>() {
                Ok(i) => DynamicValue::I64(i),
                Err(_) => DynamicValue::F64(
                    n.parse::<f64>()
                        .map_err(|_| syntax(format!("'{n}' is not a number")))?,
                ),
            },
            Token::Word(w) if w.eq_ignore_ascii_case("true") => DynamicValue::Bool(true),
            Token::Word(w) if w.eq_ignore_ascii_case("false") => DynamicValue::Bool(false),
            Token::Word(w) if w.eq_ignore_ascii_case("null") => DynamicValue::Null,
            // Bare words name enum variants.
            Token::Word(w) => DynamicValue::String(w),
            other => return Err(syntax(format!("Expected a literal, found {}", other.describe()))),
        };
        let value = self.mapper.from_dynamic(&raw, ty)?;
        let typed = self.mapper.to_dynamic(&value)?;
        Ok(Expression::literal(ty.descriptor(), typed))
    }

    fn lambda(&self, body: Expression) -> LambdaExpression {
        LambdaExpression::new(
            vec![ParameterExpression {
                name: PARAM.to_string(),
                ty: self.element.descriptor(),
            }],
            body,
        )
    }

    fn condition(&mut self) -> ServerResult<LambdaExpression> {
        let path = self.word()?;
        let (member, ty) = self.member_path(&path)?;
        let op = match self.next_token()? {
            Token::Op(op) => match op.as_str() {
                "=" | "==" => BinaryOp::Equal,
                "!=" | "<>" => BinaryOp::NotEqual,
                "<" => BinaryOp::LessThan,
                "<=" => BinaryOp::LessThanOrEqual,
                ">" => BinaryOp::GreaterThan,
                ">=" => BinaryOp::GreaterThanOrEqual,
                _ => return Err(syntax(format!("Unknown operator '{op}'"))),
            },
            other => return Err(syntax(format!("Expected an operator, found {}", other.describe()))),
        };
        let value = self.literal(&ty)?;
        Ok(self.lambda(Expression::binary(op, member, value)))
    }

    fn sort_key(&mut self) -> ServerResult<(LambdaExpression, SortDirection)> {
        let path = self.word()?;
        let (member, _) = self.member_path(&path)?;
        let direction = if self.eat_keyword("desc") {
            SortDirection::Descending
        } else {
            self.eat_keyword("asc");
            SortDirection::Ascending
        };
        Ok((self.lambda(member), direction))
    }
}

/// Compile query text against the types in `registry`.
pub fn parse_query(text: &str, registry: &TypeRegistry) -> ServerResult<QueryDescriptor> {
    let tokens = tokenize(text)?;
    let mapper = DynamicObjectMapper::default();

    let mut head = Parser {
        tokens,
        pos: 0,
        element: NativeType::bool(),
        mapper: &mapper,
    };
    head.expect_keyword("from")?;
    let type_name = head.word()?;
    let element = registry
        .get(&type_name)
        .filter(NativeType::is_record)
        .ok_or_else(|| syntax(format!("Unknown record type '{type_name}'")))?;
    let mut parser = Parser { element, ..head };

    let mut descriptor = QueryDescriptor::new(parser.element.descriptor());

    if parser.eat_keyword("where") {
        loop {
            descriptor = descriptor.filter(parser.condition()?);
            if !parser.eat_keyword("and") {
                break;
            }
        }
    }

    if parser.eat_keyword("order") {
        parser.expect_keyword("by")?;
        loop {
            let (key, direction) = parser.sort_key()?;
            descriptor = descriptor.sort(key, direction);
            if parser.peek() != Some(&Token::Comma) {
                break;
            }
            parser.pos += 1;
        }
    }

    if parser.eat_keyword("skip") {
        descriptor = descriptor.skip(parser.count()?);
    }
    if parser.eat_keyword("take") {
        descriptor = descriptor.take(parser.count()?);
    }

    if let Some(extra) = parser.peek() {
        return Err(syntax(format!("Unexpected '{}'", extra.describe())));
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_query::FieldDef;

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        let customer = NativeType::record(
            "Customer",
            vec![FieldDef::new("Name", NativeType::string())],
        );
        let order = NativeType::record(
            "Order",
            vec![
                FieldDef::new("Id", NativeType::i32()),
                FieldDef::new("Total", NativeType::f64()),
                FieldDef::new("Customer", customer.clone()),
            ],
        );
        registry.register(customer).unwrap();
        registry.register(order).unwrap();
        registry
    }

    #[test]
    fn test_full_query() {
        let descriptor = parse_query(
            "from Order where Total >= 10 and Customer.Name = 'Ada' order by Total desc, Id skip 1 take 2",
            &registry(),
        )
        .unwrap();

        assert_eq!(descriptor.element_type.name, "Order");
        assert_eq!(descriptor.filters.len(), 2);
        assert_eq!(descriptor.sort_keys.len(), 2);
        assert_eq!(descriptor.sort_keys[0].direction, SortDirection::Descending);
        assert_eq!(descriptor.sort_keys[1].direction, SortDirection::Ascending);
        assert_eq!(descriptor.skip, Some(1));
        assert_eq!(descriptor.take, Some(2));
    }

    #[test]
    fn test_literal_takes_member_type() {
        let descriptor = parse_query("FROM Order WHERE Total > 10", &registry()).unwrap();
        match descriptor.filters[0].body.as_ref() {
            Expression::Binary(b) => match b.right.as_ref() {
                Expression::Constant(c) => assert_eq!(c.ty.name, "f64"),
                other => panic!("unexpected {}", other.node_name()),
            },
            other => panic!("unexpected {}", other.node_name()),
        }
    }

    #[test]
    fn test_unknown_member() {
        let err = parse_query("FROM Order WHERE Price > 1", &registry()).unwrap_err();
        assert!(err.to_string().contains("no member 'Price'"));
    }

    #[test]
    fn test_unknown_type_and_trailing_tokens() {
        assert!(parse_query("FROM Invoice", &registry()).is_err());
        assert!(parse_query("FROM Order TAKE 1 SKIP 2", &registry()).is_err());
        assert!(parse_query("FROM Order WHERE Id = 'x", &registry()).is_err());
    }
}
