use super::{SharedTool, Tool};
use async_trait::async_trait;
use loomcore::{
    Capability, NodeContext, NodeError, SuppliedData, SupplyDataNode, SupplyResponse,
};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Op(char),
    Open,
    Close,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut number = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = number
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", number))?;
                tokens.push(Token::Number(value));
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::Open);
                chars.next();
            }
            ')' => {
                tokens.push(Token::Close);
                chars.next();
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.next();
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            self.next();
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs;
            } else if rhs == 0.0 {
                return Err("division by zero".to_string());
            } else {
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Op('-')) => Ok(-self.factor()?),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// Evaluate an arithmetic expression with `+ - * /` and parentheses.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let mut parser = Parser {
        tokens: tokenize(expr)?,
        pos: 0,
    };
    let value = parser.expr()?;
    if parser.pos < parser.tokens.len() {
        return Err("trailing input".to_string());
    }
    Ok(value)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Default)]
pub struct Calculator;

#[async_trait]
impl Tool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluates arithmetic expressions"
    }

    async fn call(&self, input: &str) -> Result<String, NodeError> {
        evaluate(input)
            .map(format_number)
            .map_err(|e| NodeError::ExecutionFailed(format!("calculator: {}", e)))
    }
}

/// Reports the current UTC time.
#[derive(Debug, Default)]
pub struct Clock;

#[async_trait]
impl Tool for Clock {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Returns the current time in RFC 3339 format"
    }

    async fn call(&self, _input: &str) -> Result<String, NodeError> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

pub struct CalculatorNode;

#[async_trait]
impl SupplyDataNode for CalculatorNode {
    async fn supply_data(&self, _ctx: &NodeContext, _output_index: usize) -> Result<SupplyResponse, NodeError> {
        let tool: SharedTool = Arc::new(Calculator);
        Ok(SupplyResponse::single(tool))
    }
}

/// Supplies several tools through one connection.
pub struct ToolkitNode;

#[async_trait]
impl SupplyDataNode for ToolkitNode {
    async fn supply_data(&self, ctx: &NodeContext, _output_index: usize) -> Result<SupplyResponse, NodeError> {
        let tools: Vec<SharedTool> = vec![Arc::new(Calculator), Arc::new(Clock)];
        ctx.events.info(format!("Toolkit provides {} tools", tools.len()));
        Ok(SupplyResponse::new(SuppliedData::Collection(
            tools.into_iter().map(Capability::new).collect(),
        )))
    }
}
