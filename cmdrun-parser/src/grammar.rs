use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "timeout.pest"]
pub struct TimeoutParser;
