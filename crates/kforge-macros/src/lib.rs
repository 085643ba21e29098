//! Attribute macros that wire pipeline steps into kforge's planner and executor.
//!
//! `#[Task(...)]` on a step config struct generates `plan`/`exec` glue; the struct
//! itself supplies `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
//! `#[Module(...)]` on a unit struct implements `Module` + `ModuleExec` over a list of
//! task structs.

use proc_macro::TokenStream;

use quote::quote;
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, MetaNameValue, Token,
    parse::Parser, punctuated::Punctuated, spanned::Spanned,
};

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    task_impl(attr, item).unwrap_or_else(|e| e.to_compile_error().into())
}

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    module_impl(attr, item).unwrap_or_else(|e| e.to_compile_error().into())
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

fn array_elems(expr: &Expr) -> syn::Result<impl Iterator<Item = &Expr>> {
    match expr {
        Expr::Array(ExprArray { elems, .. }) => Ok(elems.iter()),
        _ => Err(syn::Error::new(expr.span(), "expected array literal")),
    }
}

fn array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    array_elems(expr)?.map(lit_str).collect()
}

fn array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    array_elems(expr)?
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
        .filter(|a| !(a.path().is_ident("Task") || a.path().is_ident("Module")))
        .cloned()
        .collect()
}

/// Parse `key = value, ...` and hand each pair to `visit`.
fn for_each_kv(
    attr: TokenStream,
    mut visit: impl FnMut(&str, &MetaNameValue) -> syn::Result<()>,
) -> syn::Result<()> {
    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse(attr)?;
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        visit(&key, &nv)?;
    }
    Ok(())
}

#[derive(Default)]
struct TaskMeta {
    id: Option<String>,
    module: Option<String>,
    phase: Option<String>,
    config_ty: Option<syn::Type>,
    config_path: Option<String>,
    provides: Vec<String>,
    after: Vec<String>,
    default_label: Option<String>,
    core: bool,
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut meta = TaskMeta::default();
    for_each_kv(attr, |key, nv| {
        let v = &nv.value;
        match key {
            "id" => meta.id = Some(lit_str(v)?),
            "module" => meta.module = Some(lit_str(v)?),
            "phase" => meta.phase = Some(lit_str(v)?),
            "config" => meta.config_ty = Some(type_of(v)?),
            "config_path" => meta.config_path = Some(lit_str(v)?),
            "provides" => meta.provides = array_strings(v)?,
            "after" => meta.after = array_strings(v)?,
            "default_label" => meta.default_label = Some(lit_str(v)?),
            "core" => meta.core = lit_bool(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
        Ok(())
    })?;

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Task: missing {what}"));
    let id = meta.id.ok_or_else(|| missing("id"))?;
    let module = meta.module.ok_or_else(|| missing("module"))?;
    let phase = meta.phase.ok_or_else(|| missing("phase"))?;
    let default_label = meta.default_label.ok_or_else(|| missing("default_label"))?;
    let config_ty = meta.config_ty.unwrap_or_else(|| parse_quote!(#ident));

    // Default step config location: <module>.steps.<last segment of id>.
    let config_path = match meta.config_path {
        Some(p) => p,
        None => {
            let step = id
                .strip_prefix(&format!("{module}."))
                .and_then(|rest| rest.rsplit('.').next())
                .ok_or_else(|| {
                    syn::Error::new(
                        ident.span(),
                        "Task: config_path omitted but id does not start with '<module>.'",
                    )
                })?;
            format!("{module}.steps.{step}")
        }
    };

    let provides = meta.provides;
    let after = meta.after;
    let core = meta.core;

    let enabled_gate = if core {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::config(format!(
                    "[{}].enabled=false is not allowed (required step)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let expanded = quote! {
        #st

        impl #ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc.section::<#config_ty>(#config_path)?;
                #enabled_gate

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label: cfg.label.clone().unwrap_or_else(|| #default_label.to_string()),
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg: #config_ty = doc.section::<#config_ty>(#config_path)?;
                #enabled_gate

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
    for_each_kv(attr, |key, nv| {
        let v = &nv.value;
        match key {
            "id" => id = Some(lit_str(v)?),
            "config" => config_ty = Some(type_of(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "tasks" => tasks = Some(array_paths(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
        Ok(())
    })?;

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Module: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let config_ty = config_ty.ok_or_else(|| missing("config"))?;
    let config_path = config_path.unwrap_or_else(|| id.clone());
    let tasks = tasks.ok_or_else(|| missing("tasks"))?;

    let plan_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let register_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(self.id())
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc.section::<#config_ty>(#config_path)?;
                if !cfg.enabled {
                    return Ok(());
                }
                #(#plan_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#register_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
