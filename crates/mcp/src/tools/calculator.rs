// Arithmetic tools served by the calculator-server binary

use super::{json_schema_number, json_schema_object, json_schema_string, Tool};
use crate::schema::CallToolResult;
use crate::server::McpServer;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use switchyard_core::{ResourceDescriptor, ToolDescriptor};

pub const MATH_CONSTANTS_URI: &str = "resource://math-constants";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "×",
            Self::Divide => "÷",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Add => "Add two numbers together.",
            Self::Subtract => "Subtract the second number from the first.",
            Self::Multiply => "Multiply two numbers together.",
            Self::Divide => "Divide the first number by the second.",
        }
    }
}

#[derive(Debug, Deserialize)]
struct BinaryArgs {
    a: f64,
    b: f64,
}

/// One of the four binary arithmetic operations
pub struct ArithmeticTool {
    op: Operation,
}

impl ArithmeticTool {
    pub fn new(op: Operation) -> Self {
        Self { op }
    }
}

#[async_trait::async_trait]
impl Tool for ArithmeticTool {
    fn descriptor(&self) -> ToolDescriptor {
        let (a, b) = match self.op {
            Operation::Divide => ("Dividend (number to be divided)", "Divisor (number to divide by)"),
            Operation::Subtract => ("Number to subtract from", "Number to subtract"),
            _ => ("First number", "Second number"),
        };
        ToolDescriptor::new(
            self.op.name(),
            json_schema_object(
                serde_json::json!({
                    "a": json_schema_number(a),
                    "b": json_schema_number(b)
                }),
                vec!["a", "b"],
            ),
        )
        .with_description(self.op.description())
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let BinaryArgs { a, b } = serde_json::from_value(arguments)
            .with_context(|| format!("Invalid arguments for {}", self.op.name()))?;

        let result = match self.op {
            Operation::Add => a + b,
            Operation::Subtract => a - b,
            Operation::Multiply => a * b,
            Operation::Divide => {
                if b == 0.0 {
                    return Ok(CallToolResult::error(
                        "Error: Division by zero is not allowed",
                    ));
                }
                a / b
            }
        };

        Ok(CallToolResult::text(format!(
            "{} {} {} = {}",
            a,
            self.op.symbol(),
            b,
            result
        )))
    }
}

#[derive(Debug, Deserialize)]
struct PowerArgs {
    base: f64,
    exponent: f64,
}

pub struct PowerTool;

#[async_trait::async_trait]
impl Tool for PowerTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "power",
            json_schema_object(
                serde_json::json!({
                    "base": json_schema_number("The base number"),
                    "exponent": json_schema_number("The power to raise the base to")
                }),
                vec!["base", "exponent"],
            ),
        )
        .with_description("Raise a number to a power.")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let PowerArgs { base, exponent } =
            serde_json::from_value(arguments).context("Invalid arguments for power")?;

        let result = base.powf(exponent);
        if !result.is_finite() {
            return Ok(CallToolResult::error(format!(
                "Error calculating power: {}^{} has no finite real value",
                base, exponent
            )));
        }
        Ok(CallToolResult::text(format!("{}^{} = {}", base, exponent, result)))
    }
}

#[derive(Debug, Deserialize)]
struct SquareRootArgs {
    number: f64,
}

pub struct SquareRootTool;

#[async_trait::async_trait]
impl Tool for SquareRootTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "square_root",
            json_schema_object(
                serde_json::json!({
                    "number": json_schema_number("The number to find the square root of")
                }),
                vec!["number"],
            ),
        )
        .with_description("Calculate the square root of a number.")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let SquareRootArgs { number } =
            serde_json::from_value(arguments).context("Invalid arguments for square_root")?;

        if number < 0.0 {
            return Ok(CallToolResult::error(
                "Error: Cannot calculate square root of negative number",
            ));
        }
        Ok(CallToolResult::text(format!("√{} = {}", number, number.sqrt())))
    }
}

#[derive(Debug, Deserialize)]
struct CountArgs {
    text: String,
}

/// Counts the letter R, ignoring case
pub struct CountRsTool;

#[async_trait::async_trait]
impl Tool for CountRsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "count_rs",
            json_schema_object(
                serde_json::json!({
                    "text": json_schema_string("The input string to search for the letter 'R'")
                }),
                vec!["text"],
            ),
        )
        .with_description(
            "Count all occurrences of the letter 'R' (case-insensitive) in the input string.",
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<CallToolResult> {
        let CountArgs { text } =
            serde_json::from_value(arguments).context("Invalid arguments for count_rs")?;

        let count = text.chars().filter(|c| matches!(c, 'r' | 'R')).count();
        Ok(CallToolResult::text(format!(
            "The letter 'R' appears {} times in: '{}'",
            count, text
        )))
    }
}

/// Every calculator tool, in registration order.
pub fn tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ArithmeticTool::new(Operation::Add)),
        Arc::new(ArithmeticTool::new(Operation::Subtract)),
        Arc::new(ArithmeticTool::new(Operation::Multiply)),
        Arc::new(ArithmeticTool::new(Operation::Divide)),
        Arc::new(PowerTool),
        Arc::new(SquareRootTool),
        Arc::new(CountRsTool),
    ]
}

/// The calculator server with every tool and the constants resource.
pub fn server() -> McpServer {
    let server = tools()
        .into_iter()
        .fold(McpServer::new("calculator", env!("CARGO_PKG_VERSION")), |server, tool| {
            server.with_tool(tool)
        });
    server.with_resource(math_constants_descriptor(), math_constants())
}

pub fn math_constants_descriptor() -> ResourceDescriptor {
    let mut descriptor = ResourceDescriptor::new(MATH_CONSTANTS_URI, "math_constants");
    descriptor.description =
        Some("A collection of important mathematical constants.".to_string());
    descriptor.mime_type = Some("text/plain".to_string());
    descriptor
}

/// Text body of `resource://math-constants`
pub fn math_constants() -> String {
    use std::f64::consts;

    let constants = [
        ("π (Pi)", consts::PI),
        ("e (Euler's number)", consts::E),
        ("τ (Tau)", consts::TAU),
        ("φ (Golden ratio)", (1.0 + 5f64.sqrt()) / 2.0),
        ("√2 (Square root of 2)", consts::SQRT_2),
        ("√3 (Square root of 3)", 3f64.sqrt()),
        ("ln(2) (Natural log of 2)", consts::LN_2),
        ("ln(10) (Natural log of 10)", consts::LN_10),
    ];

    let mut out = String::from("Mathematical Constants:\n");
    out.push_str(&"=".repeat(25));
    out.push_str("\n\n");
    for (name, value) in constants {
        out.push_str(&format!("{:<25} = {:.10}\n", name, value));
    }
    out.push_str("\nThese constants can be used in calculations with the calculator tools.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(result: &CallToolResult) -> &str {
        result.content[0].as_text().unwrap()
    }

    #[tokio::test]
    async fn test_arithmetic_formatting() {
        let add = ArithmeticTool::new(Operation::Add);
        let result = add.execute(json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(text(&result), "2 + 3 = 5");
        assert!(!result.is_error());

        let multiply = ArithmeticTool::new(Operation::Multiply);
        let result = multiply.execute(json!({"a": 1.5, "b": 4})).await.unwrap();
        assert_eq!(text(&result), "1.5 × 4 = 6");
    }

    #[tokio::test]
    async fn test_divide_by_zero_is_tool_error() {
        let divide = ArithmeticTool::new(Operation::Divide);
        let result = divide.execute(json!({"a": 1, "b": 0})).await.unwrap();
        assert!(result.is_error());
        assert_eq!(text(&result), "Error: Division by zero is not allowed");
    }

    #[tokio::test]
    async fn test_bad_arguments_are_errors() {
        let add = ArithmeticTool::new(Operation::Add);
        assert!(add.execute(json!({"a": "two"})).await.is_err());
    }

    #[tokio::test]
    async fn test_square_root_and_power() {
        let result = SquareRootTool.execute(json!({"number": 16})).await.unwrap();
        assert_eq!(text(&result), "√16 = 4");
        assert!(SquareRootTool
            .execute(json!({"number": -1}))
            .await
            .unwrap()
            .is_error());

        let result = PowerTool
            .execute(json!({"base": 2, "exponent": 10}))
            .await
            .unwrap();
        assert_eq!(text(&result), "2^10 = 1024");
    }

    #[tokio::test]
    async fn test_count_rs_ignores_case() {
        let result = CountRsTool
            .execute(json!({"text": "Raspberry rRr"}))
            .await
            .unwrap();
        assert_eq!(
            text(&result),
            "The letter 'R' appears 6 times in: 'Raspberry rRr'"
        );
    }

    #[test]
    fn test_math_constants_table() {
        let body = math_constants();
        assert!(body.starts_with("Mathematical Constants:\n=========================\n\n"));
        assert!(body.contains("= 3.1415926536"));
        assert_eq!(body.lines().filter(|l| l.contains(" = ")).count(), 8);
    }
}
