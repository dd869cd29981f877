//! Inspect command: show how a cell expression parses.

use cellar_core::NodeId;
use cellar_core::expr::{self, Expr};

pub fn execute(text: &str) -> anyhow::Result<()> {
    let Some(expression) = expr::parse(&NodeId::from("inspect"), text)? else {
        println!("(blank expression)");
        return Ok(());
    };

    println!("output: {}", expression.target().unwrap_or("(none)"));
    if expression.inputs().is_empty() {
        println!("inputs: (none)");
    } else {
        println!("inputs: {}", expression.inputs().join(", "));
    }
    println!("tree:   {}", render(expression.root()));
    Ok(())
}

/// Render a call tree in canonical call syntax.
fn render(expr: &Expr) -> String {
    match expr {
        Expr::Literal(value) => value.to_string(),
        Expr::Variable(name) => name.clone(),
        Expr::Call(call) => {
            let args: Vec<String> = call
                .args
                .iter()
                .map(|arg| match &arg.name {
                    Some(name) => format!("{name} = {}", render(&arg.value)),
                    None => render(&arg.value),
                })
                .collect();
            format!("{}({})", call.name, args.join(", "))
        }
    }
}
