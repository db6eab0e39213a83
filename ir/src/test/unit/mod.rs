mod ast;
mod sint;
