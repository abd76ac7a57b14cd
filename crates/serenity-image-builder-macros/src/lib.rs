use proc_macro::TokenStream;

use quote::quote;
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Turns a unit struct into a pipeline task.
///
/// Keys: `id`, `module`, `phase`, `default_label` (required) and `config`,
/// `config_path`, `provides`, `after` (optional). The annotated type must
/// provide `fn run(cfg: &Config, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Groups tasks into a module that plans and registers them together.
///
/// The `config` type must implement `Default` and provide
/// `fn validate(&self) -> Result<()>`, checked when the module is planned.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn string_list(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn path_list(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems
        .iter()
        .map(|e| match e {
            Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
            _ => Err(syn::Error::new(e.span(), "expected path (identifier)")),
        })
        .collect()
}

fn type_of(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(
            expr.span(),
            "expected type (path) or string",
        )),
    }
}

fn strip_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            !(p.is_ident("Task") || p.is_ident("Module"))
        })
        .cloned()
        .collect()
}

fn parse_pairs(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut default_label: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();

    for (key, v, span) in parse_pairs(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "module" => module = Some(lit_str(&v)?),
            "phase" => phase = Some(lit_str(&v)?),
            "default_label" => default_label = Some(lit_str(&v)?),
            "config" => config_ty = Some(type_of(&v)?),
            "config_path" => config_path = Some(lit_str(&v)?),
            "provides" => provides = string_list(&v)?,
            "after" => after = string_list(&v)?,
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Task: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let module = module.ok_or_else(|| missing("module"))?;
    let phase = phase.ok_or_else(|| missing("phase"))?;
    let default_label = default_label.ok_or_else(|| missing("default_label"))?;

    let step = id
        .strip_prefix(&format!("{module}."))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| syn::Error::new(ident.span(), "Task: id must start with '<module>.'"))?
        .to_string();
    let step_path = format!("{module}.steps.{step}");
    let config_ty = config_ty.unwrap_or_else(|| parse_quote!(#ident));
    let config_path = config_path.unwrap_or_else(|| module.clone());

    let expanded = quote! {
        #st

        impl #ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const STEP_PATH: &'static str = #step_path;

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let step: crate::modules::StepConfig = doc
                    .deserialize_path::<crate::modules::StepConfig>(#step_path)?
                    .unwrap_or_default();
                let label = step
                    .label
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(#default_label)
                    .to_string();

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label,
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: exec {}", #id));
                    return Ok(());
                }

                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;
    let mut required = false;

    for (key, v, span) in parse_pairs(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "config" => config_ty = Some(type_of(&v)?),
            "config_path" => config_path = Some(lit_str(&v)?),
            "tasks" => tasks = Some(path_list(&v)?),
            "required" => required = lit_bool(&v)?,
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Module: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let config_ty = config_ty.ok_or_else(|| missing("config"))?;
    let config_path = config_path.unwrap_or_else(|| id.clone());
    let tasks = tasks.ok_or_else(|| missing("tasks"))?;

    let plan_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let reg_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                #required || doc.has_table_path(self.id())
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                // Surface config errors at plan time rather than mid-run.
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();
                cfg.validate()?;

                #(#plan_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#reg_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
