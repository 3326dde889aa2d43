//! HTML pages: the public login page and the protected dashboard.

use axum::{
    Extension,
    extract::Query,
    response::{Html, IntoResponse},
};
use quick_xml::escape::escape;

use super::auth::LoginParams;
use crate::{config::is_local_path, saml::SamlIdentity};

/// Public landing page with the single sign-on button.
#[tracing::instrument(name = "pages.login", skip(params))]
pub async fn login_page(Query(params): Query<LoginParams>) -> impl IntoResponse {
    let action = match params.return_to.as_deref().filter(|p| is_local_path(p)) {
        Some(path) => format!(
            "/login?{}",
            url::form_urlencoded::Serializer::new(String::new())
                .append_pair("return_to", path)
                .finish()
        ),
        None => "/login".to_string(),
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Sign in</title>
</head>
<body>
  <main>
    <h1>Sign in</h1>
    <form method="post" action="{}">
      <button type="submit">Sign in with SSO</button>
    </form>
  </main>
</body>
</html>
"#,
        escape(action.as_str())
    ))
}

/// Protected page showing who is signed in.
#[tracing::instrument(name = "pages.dashboard", skip(identity))]
pub async fn dashboard(Extension(identity): Extension<SamlIdentity>) -> impl IntoResponse {
    let display_name = identity
        .name
        .as_deref()
        .or(identity.email.as_deref())
        .unwrap_or(&identity.name_id);

    let mut details = format!(
        "      <dt>Subject</dt><dd>{}</dd>\n      <dt>Identity provider</dt><dd>{}</dd>\n",
        escape(identity.name_id.as_str()),
        escape(identity.issuer.as_str()),
    );
    if let Some(email) = &identity.email {
        details.push_str(&format!(
            "      <dt>Email</dt><dd>{}</dd>\n",
            escape(email.as_str())
        ));
    }
    if !identity.roles.is_empty() {
        details.push_str(&format!(
            "      <dt>Roles</dt><dd>{}</dd>\n",
            escape(identity.roles.join(", ").as_str())
        ));
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Dashboard</title>
</head>
<body>
  <main>
    <h1>Welcome, {}</h1>
    <dl>
{}    </dl>
    <form method="post" action="/logout">
      <button type="submit">Sign out</button>
    </form>
  </main>
</body>
</html>
"#,
        escape(display_name),
        details
    ))
}
