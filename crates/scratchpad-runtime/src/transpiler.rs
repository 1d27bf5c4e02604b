//! Source compilation for guest code.
//!
//! TypeScript is transpiled with SWC: types are stripped and ES module
//! syntax is lowered to `require()` calls so the result runs as a plain
//! script. No type checking happens; only syntax errors are reported.
//!
//! JavaScript is parsed once to surface syntax errors as compile errors and
//! is otherwise passed through untouched.
//!
//! Either way, source with a top-level `return` is wrapped in a function so
//! that its return value becomes the script's completion value.

use serde::{Deserialize, Serialize};
use swc_common::{BytePos, FileName, GLOBALS, Globals, Mark, SourceMap, Spanned, sync::Lrc};
use swc_ecma_ast::*;
use swc_ecma_codegen::{Config as CodegenConfig, Emitter, text_writer::JsWriter};
use swc_ecma_parser::error::{Error as ParseError, SyntaxError};
use swc_ecma_parser::{EsSyntax, Parser, StringInput, Syntax, TsSyntax, lexer::Lexer};
use swc_ecma_transforms_base::{fixer::fixer, resolver};
use swc_ecma_transforms_typescript::strip;
use swc_ecma_visit::{Visit, VisitMut, VisitMutWith, VisitWith};
use thiserror::Error;

/// Global the runtime defines for lowered dynamic `import()`.
pub const DYNAMIC_IMPORT_FN: &str = "__scratchpadImport";

#[derive(Error, Debug)]
pub enum TranspileError {
    #[error("SyntaxError: {0}")]
    Parse(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Codegen error: {0}")]
    Codegen(String),
}

/// Source language of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "js")]
    JavaScript,
    #[serde(alias = "ts")]
    TypeScript,
}

impl Language {
    /// Infer the language from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "js" | "cjs" | "mjs" | "jsx" => Some(Self::JavaScript),
            "ts" | "cts" | "mts" | "tsx" => Some(Self::TypeScript),
            _ => None,
        }
    }
}

/// Script ready to be evaluated in a guest context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledScript {
    pub code: String,
    /// The source used a top-level `return` and was wrapped in a function.
    pub wrapped: bool,
}

#[derive(Debug)]
pub struct TranspileResult {
    /// The transpiled JavaScript code.
    pub code: String,
    /// Whether a `return` statement appears outside any function.
    pub has_top_level_return: bool,
}

#[derive(Debug, Clone)]
pub struct TranspileOptions {
    /// Target ECMAScript version. Default: ES2020.
    pub target: EsVersion,
    /// File name for error messages. Default: "script.ts".
    pub filename: String,
}

impl Default for TranspileOptions {
    fn default() -> Self {
        Self {
            target: EsVersion::Es2020,
            filename: "script.ts".to_string(),
        }
    }
}

/// Compile guest source into an evaluable script.
pub fn compile(source: &str, language: Language) -> Result<CompiledScript, TranspileError> {
    let (code, has_return) = match language {
        Language::TypeScript => {
            let result = transpile_typescript(source)?;
            (result.code, result.has_top_level_return)
        }
        Language::JavaScript => {
            let has_return = check_javascript(source)?;
            (source.to_string(), has_return)
        }
    };

    if has_return {
        Ok(CompiledScript {
            code: format!("(function () {{\n{code}\n}}).call(this)"),
            wrapped: true,
        })
    } else {
        Ok(CompiledScript {
            code,
            wrapped: false,
        })
    }
}

/// Parse JavaScript as a classic script.
///
/// Returns whether the script has a top-level `return`.
pub fn check_javascript(source: &str) -> Result<bool, TranspileError> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(
        Lrc::new(FileName::Custom("script.js".to_string())),
        source.to_string(),
    );

    let syntax = Syntax::Es(EsSyntax {
        allow_return_outside_function: true,
        ..Default::default()
    });
    let lexer = Lexer::new(syntax, EsVersion::latest(), StringInput::from(&*fm), None);
    let mut parser = Parser::new_from(lexer);

    let script = parser
        .parse_script()
        .map_err(|e| TranspileError::Parse(describe(&cm, e.span().lo, &e.kind().msg())))?;

    reject_recovered(&cm, parser.take_errors())?;

    Ok(has_top_level_return(&script))
}

/// Transpile TypeScript code to JavaScript.
pub fn transpile_typescript(source: &str) -> Result<TranspileResult, TranspileError> {
    transpile_typescript_with_options(source, TranspileOptions::default())
}

/// Transpile TypeScript code to JavaScript with custom options.
pub fn transpile_typescript_with_options(
    source: &str,
    options: TranspileOptions,
) -> Result<TranspileResult, TranspileError> {
    let cm: Lrc<SourceMap> = Default::default();

    let fm = cm.new_source_file(
        Lrc::new(FileName::Custom(options.filename.clone())),
        source.to_string(),
    );

    let syntax = Syntax::Typescript(TsSyntax {
        tsx: false,
        decorators: true,
        dts: false,
        no_early_errors: false,
        disallow_ambiguous_jsx_like: false,
    });

    let lexer = Lexer::new(syntax, options.target, StringInput::from(&*fm), None);

    let mut parser = Parser::new_from(lexer);

    let module = parser
        .parse_module()
        .map_err(|e| TranspileError::Parse(describe(&cm, e.span().lo, &e.kind().msg())))?;

    reject_recovered(&cm, parser.take_errors())?;

    let mut program = Program::Module(module);

    GLOBALS.set(&Globals::default(), || {
        let unresolved_mark = Mark::new();
        let top_level_mark = Mark::new();

        program.visit_mut_with(&mut resolver(unresolved_mark, top_level_mark, true));
        program.mutate(&mut strip(unresolved_mark, top_level_mark));
        program.visit_mut_with(&mut fixer(None));
    });

    let mut module = match program {
        Program::Module(m) => m,
        Program::Script(_) => {
            return Err(TranspileError::Transform(
                "Expected module, got script".to_string(),
            ));
        }
    };

    let mut lowering = ImportLowering::default();
    module.visit_mut_with(&mut lowering);
    if let Some(err) = lowering.error {
        return Err(err);
    }

    let has_top_level_return = has_top_level_return(&module);

    let mut buf = vec![];
    {
        let writer = JsWriter::new(cm.clone(), "\n", &mut buf, None);

        let codegen_config = CodegenConfig::default()
            .with_target(options.target)
            .with_ascii_only(false)
            .with_minify(false)
            .with_omit_last_semi(false);

        let mut emitter = Emitter {
            cfg: codegen_config,
            cm: cm.clone(),
            comments: None,
            wr: writer,
        };

        emitter
            .emit_module(&module)
            .map_err(|e| TranspileError::Codegen(format!("Failed to emit code: {}", e)))?;
    }

    let code = String::from_utf8(buf)
        .map_err(|e| TranspileError::Codegen(format!("Invalid UTF-8 output: {}", e)))?;

    Ok(TranspileResult {
        code,
        has_top_level_return,
    })
}

/// Fail on the first recovered parse error other than a top-level `return`.
fn reject_recovered(cm: &SourceMap, errors: Vec<ParseError>) -> Result<(), TranspileError> {
    match errors
        .into_iter()
        .find(|e| !matches!(e.kind(), SyntaxError::ReturnNotAllowed))
    {
        Some(e) => Err(TranspileError::Parse(describe(cm, e.span().lo, &e.kind().msg()))),
        None => Ok(()),
    }
}

fn describe(cm: &SourceMap, pos: BytePos, msg: &str) -> String {
    let loc = cm.lookup_char_pos(pos);
    format!("{} ({}:{})", msg, loc.line, loc.col_display + 1)
}

fn has_top_level_return<N: VisitWith<TopLevelReturn>>(node: &N) -> bool {
    let mut finder = TopLevelReturn::default();
    node.visit_with(&mut finder);
    finder.found
}

/// Finds `return` statements that are not nested in any function body.
#[derive(Default)]
struct TopLevelReturn {
    found: bool,
}

impl Visit for TopLevelReturn {
    fn visit_return_stmt(&mut self, _: &ReturnStmt) {
        self.found = true;
    }

    fn visit_function(&mut self, _: &Function) {}

    fn visit_arrow_expr(&mut self, _: &ArrowExpr) {}

    fn visit_constructor(&mut self, _: &Constructor) {}

    fn visit_getter_prop(&mut self, _: &GetterProp) {}

    fn visit_setter_prop(&mut self, _: &SetterProp) {}

    fn visit_static_block(&mut self, _: &StaticBlock) {}
}

/// Lowers ES module syntax to CommonJS-style `require()` calls.
///
/// Bindings become `const` snapshots of the required module. Exports are
/// dropped: a scratch script has no importer.
#[derive(Default)]
struct ImportLowering {
    next_temp: usize,
    error: Option<TranspileError>,
}

impl ImportLowering {
    fn temp_name(&mut self) -> String {
        let name = format!("__import_{}", self.next_temp);
        self.next_temp += 1;
        name
    }

    fn lower_import(&mut self, import: &ImportDecl) -> String {
        let src = quote(&str_value(&import.src));
        let require = format!("require({src})");

        if import.specifiers.is_empty() {
            return format!("{require};");
        }

        let mut out = String::new();
        let mut named = Vec::new();
        let mut needs_temp = import.specifiers.len() > 1;
        for specifier in &import.specifiers {
            if matches!(specifier, ImportSpecifier::Default(_)) && import.specifiers.len() == 1 {
                needs_temp = true;
            }
        }

        let module_ref = if needs_temp {
            let temp = self.temp_name();
            out.push_str(&format!("const {temp} = {require};\n"));
            temp
        } else {
            require.clone()
        };

        for specifier in &import.specifiers {
            match specifier {
                // import foo from 'mod'
                ImportSpecifier::Default(default) => {
                    out.push_str(&format!(
                        "const {local} = {m} && {m}.__esModule ? {m}.default : {m};\n",
                        local = default.local.sym.as_str(),
                        m = module_ref,
                    ));
                }
                // import * as mod from 'mod'
                ImportSpecifier::Namespace(ns) => {
                    out.push_str(&format!(
                        "const {} = {};\n",
                        ns.local.sym.as_str(),
                        module_ref
                    ));
                }
                // import { foo, bar as baz } from 'mod'
                ImportSpecifier::Named(spec) => {
                    let local = spec.local.sym.as_str();
                    let imported = match &spec.imported {
                        Some(ModuleExportName::Ident(id)) => quote(id.sym.as_str()),
                        Some(ModuleExportName::Str(s)) => quote(&str_value(s)),
                        None => quote(local),
                    };
                    named.push(format!("{imported}: {local}"));
                }
            }
        }

        if !named.is_empty() {
            out.push_str(&format!("const {{ {} }} = {};\n", named.join(", "), module_ref));
        }

        out
    }

    fn parse_into(&mut self, code: &str, items: &mut Vec<ModuleItem>) {
        match parse_statements(code) {
            Ok(stmts) => items.extend(stmts.into_iter().map(ModuleItem::Stmt)),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
    }
}

impl VisitMut for ImportLowering {
    fn visit_mut_module_items(&mut self, items: &mut Vec<ModuleItem>) {
        let mut new_items = Vec::with_capacity(items.len());

        for item in items.drain(..) {
            match item {
                ModuleItem::ModuleDecl(ModuleDecl::Import(import)) => {
                    if import.type_only {
                        continue;
                    }
                    let code = self.lower_import(&import);
                    self.parse_into(&code, &mut new_items);
                }

                // export const x = 1; export function f() {}
                ModuleItem::ModuleDecl(ModuleDecl::ExportDecl(export)) => {
                    new_items.push(ModuleItem::Stmt(Stmt::Decl(export.decl)));
                }

                // export default <expr>
                ModuleItem::ModuleDecl(ModuleDecl::ExportDefaultExpr(export)) => {
                    new_items.push(ModuleItem::Stmt(Stmt::Expr(ExprStmt {
                        span: export.span,
                        expr: export.expr,
                    })));
                }

                // export default function f() {} / class C {}
                ModuleItem::ModuleDecl(ModuleDecl::ExportDefaultDecl(export)) => match export.decl {
                    DefaultDecl::Fn(FnExpr {
                        ident: Some(ident),
                        function,
                    }) => new_items.push(ModuleItem::Stmt(Stmt::Decl(Decl::Fn(FnDecl {
                        ident,
                        declare: false,
                        function,
                    })))),
                    DefaultDecl::Class(ClassExpr {
                        ident: Some(ident),
                        class,
                    }) => new_items.push(ModuleItem::Stmt(Stmt::Decl(Decl::Class(ClassDecl {
                        ident,
                        declare: false,
                        class,
                    })))),
                    DefaultDecl::Fn(fn_expr) => {
                        new_items.push(ModuleItem::Stmt(Stmt::Expr(ExprStmt {
                            span: export.span,
                            expr: Box::new(Expr::Paren(ParenExpr {
                                span: export.span,
                                expr: Box::new(Expr::Fn(fn_expr)),
                            })),
                        })))
                    }
                    DefaultDecl::Class(class_expr) => {
                        new_items.push(ModuleItem::Stmt(Stmt::Expr(ExprStmt {
                            span: export.span,
                            expr: Box::new(Expr::Paren(ParenExpr {
                                span: export.span,
                                expr: Box::new(Expr::Class(class_expr)),
                            })),
                        })))
                    }
                    DefaultDecl::TsInterfaceDecl(_) => {}
                },

                // export { a } from 'mod' keeps the module's side effects
                ModuleItem::ModuleDecl(ModuleDecl::ExportNamed(NamedExport {
                    src: Some(src),
                    type_only: false,
                    ..
                })) => {
                    let code = format!("require({});", quote(&str_value(&src)));
                    self.parse_into(&code, &mut new_items);
                }
                ModuleItem::ModuleDecl(ModuleDecl::ExportAll(export)) if !export.type_only => {
                    let code = format!("require({});", quote(&str_value(&export.src)));
                    self.parse_into(&code, &mut new_items);
                }

                // export { a }, export type, export =, export as namespace
                ModuleItem::ModuleDecl(_) => {}

                other => new_items.push(other),
            }
        }

        *items = new_items;

        for item in items.iter_mut() {
            item.visit_mut_children_with(self);
        }
    }

    /// `import(x)` → `__scratchpadImport(x)`
    fn visit_mut_expr(&mut self, expr: &mut Expr) {
        expr.visit_mut_children_with(self);

        if let Expr::Call(call) = expr {
            if let Callee::Import(_) = &call.callee {
                call.callee = Callee::Expr(Box::new(Expr::Ident(Ident::new(
                    DYNAMIC_IMPORT_FN.into(),
                    call.span,
                    Default::default(),
                ))));
            }
        }
    }
}

fn str_value(s: &Str) -> String {
    s.value.as_str().unwrap_or_default().to_string()
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s.replace('"', "\\\"")))
}

fn parse_statements(code: &str) -> Result<Vec<Stmt>, TranspileError> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(Lrc::new(FileName::Anon), code.to_string());

    let lexer = Lexer::new(
        Syntax::Es(EsSyntax::default()),
        EsVersion::Es2022,
        StringInput::from(&*fm),
        None,
    );

    let mut parser = Parser::new_from(lexer);
    let script = parser
        .parse_script()
        .map_err(|e| TranspileError::Transform(format!("{}", e.kind().msg())))?;
    Ok(script.body)
}
