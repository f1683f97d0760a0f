//! Recursive-descent parser for the configuration language.

use std::sync::Arc;

use crate::ast::{Branch, Decl, Expr, Kind, Pos, StrPart};
use crate::lexer::{Lexer, RawPart, Spanned, Token};
use crate::{ErrorKind, EvalError};

/// Parser over a token stream.
pub struct Parser<'s> {
    lexer: Lexer<'s>,
    look: Spanned,
    /// Declared package name, if a `package` clause was present.
    pub package: Option<String>,
}

impl<'s> Parser<'s> {
    /// New creates a parser for `src`, attributing positions to `file`.
    pub fn new(src: &'s str, file: Arc<str>) -> Result<Parser<'s>, EvalError> {
        let mut lexer = Lexer::new(src, file);
        let look = lexer.next_token()?;
        Ok(Parser {
            lexer,
            look,
            package: None,
        })
    }

    fn new_at(src: &'s str, pos: &Pos) -> Result<Parser<'s>, EvalError> {
        let mut lexer = Lexer::new_at(src, pos);
        let look = lexer.next_token()?;
        Ok(Parser {
            lexer,
            look,
            package: None,
        })
    }

    fn bump(&mut self) -> Result<Spanned, EvalError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.look, next))
    }

    fn err<S: ToString>(&self, msg: S) -> EvalError {
        EvalError::new(ErrorKind::Compile, msg.to_string()).with_pos(self.look.pos.clone())
    }

    fn expect(&mut self, tok: &Token, what: &str) -> Result<Spanned, EvalError> {
        if &self.look.tok == tok {
            self.bump()
        } else {
            Err(self.err(format!("expected {what}, found {:?}", self.look.tok)))
        }
    }

    /// File parses a whole file: optional `package` clause followed by
    /// struct declarations until EOF. The result is a struct expression.
    pub fn file(&mut self) -> Result<Expr, EvalError> {
        let pos = self.look.pos.clone();
        let has_package = matches!(&self.look.tok, Token::Ident(name) if name == "package");
        if has_package {
            self.bump()?;
            match self.bump()?.tok {
                Token::Ident(pkg) => self.package = Some(pkg),
                _ => return Err(self.err("expected package name")),
            }
        }
        let mut decls = Vec::new();
        while self.look.tok != Token::Eof {
            decls.push(self.decl()?);
            if self.look.tok == Token::Comma {
                self.bump()?;
            }
        }
        Ok(Expr::Struct(decls, pos))
    }

    /// Expression parses a single expression followed by EOF. Used for
    /// compiling interpolation bodies and standalone expressions.
    pub fn expression(&mut self) -> Result<Expr, EvalError> {
        let e = self.expr()?;
        if self.look.tok != Token::Eof {
            return Err(self.err("trailing input after expression"));
        }
        Ok(e)
    }

    fn decl(&mut self) -> Result<Decl, EvalError> {
        let pos = self.look.pos.clone();
        let label = match self.bump()?.tok {
            Token::Ident(s) => s,
            Token::Def(s) => s,
            Token::Str(parts) => {
                // Quoted labels must be literal (no interpolation).
                let mut s = String::new();
                for p in parts {
                    match p {
                        RawPart::Lit(l) => s.push_str(&l),
                        RawPart::Interp(..) => {
                            return Err(EvalError::new(
                                ErrorKind::Compile,
                                "interpolation not allowed in a label",
                            )
                            .with_pos(pos));
                        }
                    }
                }
                s
            }
            tok => {
                return Err(EvalError::new(
                    ErrorKind::Compile,
                    format!("expected field label, found {tok:?}"),
                )
                .with_pos(pos));
            }
        };
        let optional = if self.look.tok == Token::Question {
            self.bump()?;
            true
        } else {
            false
        };
        self.expect(&Token::Colon, "`:`")?;
        let value = self.expr()?;
        Ok(Decl {
            label,
            optional,
            value,
            pos,
        })
    }

    fn expr(&mut self) -> Result<Expr, EvalError> {
        let pos = self.look.pos.clone();
        let mut branches = vec![self.branch()?];
        while self.look.tok == Token::Pipe {
            self.bump()?;
            branches.push(self.branch()?);
        }
        if branches.len() == 1 {
            let b = branches.pop().expect("one branch");
            if b.default {
                return Err(EvalError::new(
                    ErrorKind::Compile,
                    "`*` marker outside a disjunction",
                )
                .with_pos(pos));
            }
            Ok(b.expr)
        } else {
            Ok(Expr::Or(branches, pos))
        }
    }

    fn branch(&mut self) -> Result<Branch, EvalError> {
        let default = if self.look.tok == Token::Star {
            self.bump()?;
            true
        } else {
            false
        };
        Ok(Branch {
            expr: self.conjunct()?,
            default,
        })
    }

    fn conjunct(&mut self) -> Result<Expr, EvalError> {
        let mut e = self.postfix()?;
        while self.look.tok == Token::Amp {
            self.bump()?;
            let rhs = self.postfix()?;
            e = Expr::And(Box::new(e), Box::new(rhs));
        }
        Ok(e)
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let e = self.primary()?;
        if self.look.tok != Token::Dot {
            return Ok(e);
        }
        // Selector chains are only meaningful on references.
        let (mut segs, pos) = match e {
            Expr::Ref(segs, pos) => (segs, pos),
            other => {
                return Err(EvalError::new(
                    ErrorKind::Compile,
                    "selector on a non-reference expression",
                )
                .with_pos(other.pos()));
            }
        };
        while self.look.tok == Token::Dot {
            self.bump()?;
            match self.bump()?.tok {
                Token::Ident(s) => segs.push(s),
                Token::Def(s) => segs.push(s),
                tok => return Err(self.err(format!("expected selector, found {tok:?}"))),
            }
        }
        Ok(Expr::Ref(segs, pos))
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let Spanned { tok, pos } = self.bump()?;
        Ok(match tok {
            Token::Int(i) => Expr::Int(i, pos),
            Token::Float(f) => Expr::Float(f, pos),
            Token::Str(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for p in parts {
                    match p {
                        RawPart::Lit(s) => out.push(StrPart::Lit(s)),
                        RawPart::Interp(body, at) => {
                            let mut sub = Parser::new_at(&body, &at)?;
                            out.push(StrPart::Interp(Box::new(sub.expression()?)));
                        }
                    }
                }
                Expr::Str(out, pos)
            }
            Token::LBrace => {
                let mut decls = Vec::new();
                while self.look.tok != Token::RBrace {
                    decls.push(self.decl()?);
                    if self.look.tok == Token::Comma {
                        self.bump()?;
                    }
                }
                self.expect(&Token::RBrace, "`}`")?;
                Expr::Struct(decls, pos)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                while self.look.tok != Token::RBracket {
                    items.push(self.expr()?);
                    if self.look.tok == Token::Comma {
                        self.bump()?;
                    } else {
                        break;
                    }
                }
                self.expect(&Token::RBracket, "`]`")?;
                Expr::List(items, pos)
            }
            Token::LParen => {
                let e = self.expr()?;
                self.expect(&Token::RParen, "`)`")?;
                e
            }
            Token::Ident(name) => match name.as_str() {
                "null" => Expr::Null(pos),
                "true" => Expr::Bool(true, pos),
                "false" => Expr::Bool(false, pos),
                "_" => Expr::Type(Kind::Any, pos),
                "string" => Expr::Type(Kind::String, pos),
                "int" => Expr::Type(Kind::Int, pos),
                "float" => Expr::Type(Kind::Float, pos),
                "number" => Expr::Type(Kind::Number, pos),
                "bool" => Expr::Type(Kind::Bool, pos),
                "package" | "import" | "let" | "for" | "if" => {
                    return Err(EvalError::new(
                        ErrorKind::Compile,
                        format!("`{name}` is not supported here"),
                    )
                    .with_pos(pos));
                }
                _ => Expr::Ref(vec![name], pos),
            },
            Token::Def(name) => Expr::Ref(vec![name], pos),
            tok => {
                return Err(EvalError::new(
                    ErrorKind::Compile,
                    format!("expected expression, found {tok:?}"),
                )
                .with_pos(pos));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Expr {
        let mut p = Parser::new(src, Arc::from("<test>")).expect("lexer");
        p.file().expect("parse")
    }

    #[test]
    fn package_clause_and_decls() {
        let mut p = Parser::new("package blog\na: 1", Arc::from("<test>")).expect("lexer");
        let e = p.file().expect("parse");
        assert_eq!(p.package.as_deref(), Some("blog"));
        match e {
            Expr::Struct(decls, _) => assert_eq!(decls.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn disjunction_with_default() {
        let e = parse("replicas: int | *1");
        let Expr::Struct(decls, _) = e else {
            panic!()
        };
        match &decls[0].value {
            Expr::Or(branches, _) => {
                assert_eq!(branches.len(), 2);
                assert!(!branches[0].default);
                assert!(branches[1].default);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn quoted_labels_and_defs() {
        let e = parse("#components: { web: { \"app.kubernetes.io/name\": \"web\" } }");
        let Expr::Struct(decls, _) = e else {
            panic!()
        };
        assert_eq!(decls[0].label, "#components");
    }

    #[test]
    fn selector_chains() {
        let e = parse("x: #config.image");
        let Expr::Struct(decls, _) = e else {
            panic!()
        };
        match &decls[0].value {
            Expr::Ref(segs, _) => assert_eq!(segs, &["#config".to_string(), "image".to_string()]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unsupported_keyword_is_diagnosed() {
        let mut p = Parser::new("a: if", Arc::from("f.cue")).expect("lexer");
        let err = p.file().expect_err("unsupported");
        assert!(err.to_string().contains("not supported"), "got: {err}");
    }
}
